//! rangefetch core - download engine
//!
//! Multi-connection, resumable HTTP downloads. The [`DownloadManager`] is
//! the entry point; it hands out [`JobHandle`]s and broadcasts
//! [`EngineEvent`](rangefetch_types::EngineEvent)s to observers.

mod engine;
mod error;

pub use engine::*;
pub use error::*;

pub use rangefetch_types as types;
