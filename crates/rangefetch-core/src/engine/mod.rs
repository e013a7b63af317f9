//! Download engine
//!
//! This module implements the multi-connection download engine:
//! - Chunk planning and a shared chunk table
//! - A worker pool doing positioned writes into one temp file
//! - Token bucket speed limiting, per job and engine-wide
//! - Classified errors with per-chunk retry budgets
//! - Resume through a sidecar checkpoint
//! - Optional adaptive concurrency and chunk splitting

mod buffer_pool;
mod chunk;
mod download_task;
mod manager;
mod monitor;
mod planner;
mod resume;
mod retry;
mod scheduler;
mod speed_controller;
mod stats;
mod transport;
mod worker_pool;

pub use buffer_pool::*;
pub use chunk::*;
pub use download_task::*;
pub use manager::*;
pub use monitor::*;
pub use planner::*;
pub use resume::*;
pub use retry::*;
pub use scheduler::*;
pub use speed_controller::*;
pub use stats::*;
pub use transport::*;
pub use worker_pool::*;
