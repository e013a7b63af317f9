//! Token bucket speed controller
//!
//! Bounds the bytes handed out per one-second window. A single controller
//! can be shared by every worker of every job (global limit) or created
//! per job. The window state sits behind one mutex; waiting happens
//! outside the lock so other workers can keep checking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Refill window length
const WINDOW: Duration = Duration::from_secs(1);

/// Rate limiter with a fixed one-second refill window
#[derive(Clone, Debug)]
pub struct SpeedController {
    state: Arc<Mutex<WindowState>>,
}

#[derive(Debug)]
struct WindowState {
    /// Bytes per second, 0 = unlimited
    limit: u64,
    /// Bytes granted in the current window
    consumed: u64,
    /// When the current window opened
    window_start: Instant,
}

impl SpeedController {
    /// Create a controller allowing `bytes_per_second` (0 = unlimited)
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState {
                limit: bytes_per_second,
                consumed: 0,
                window_start: Instant::now(),
            })),
        }
    }

    /// Create a controller that never throttles
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Change the limit; takes effect on the next acquire
    pub async fn set_limit(&self, bytes_per_second: u64) {
        let mut state = self.state.lock().await;
        state.limit = bytes_per_second;
    }

    pub async fn limit(&self) -> u64 {
        self.state.lock().await.limit
    }

    /// Wait until `bytes` may be transferred
    ///
    /// A request larger than the whole limit is granted at the start of a
    /// fresh window so it cannot starve.
    pub async fn acquire(&self, bytes: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;

                if state.limit == 0 {
                    return;
                }

                let now = Instant::now();
                let elapsed = now.duration_since(state.window_start);
                if elapsed >= WINDOW {
                    state.window_start = now;
                    state.consumed = 0;
                }

                if state.consumed == 0 || state.consumed.saturating_add(bytes) <= state.limit {
                    state.consumed = state.consumed.saturating_add(bytes);
                    return;
                }

                WINDOW.saturating_sub(now.duration_since(state.window_start))
            };

            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_grants_within_window_immediately() {
        let controller = SpeedController::new(1000);

        let start = Instant::now();
        controller.acquire(500).await;
        controller.acquire(500).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        // Window is full; the next grant waits for the refill
        controller.acquire(500).await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_stays_under_limit() {
        let limit = 64 * 1024;
        let buffer = 8 * 1024;
        let controller = SpeedController::new(limit);

        let start = Instant::now();
        let mut granted = 0u64;
        while granted < 5 * limit {
            controller.acquire(buffer).await;
            granted += buffer;
        }

        // 5 windows worth of data needs at least 4 refills
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_between_tasks() {
        let controller = SpeedController::new(10_000);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    controller.acquire(1_000).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 20_000 bytes at 10_000/s spans a second window
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_blocks_until_refill() {
        let controller = SpeedController::new(1000);
        controller.acquire(1000).await;

        let mut waiting = tokio_test::task::spawn(controller.acquire(1));
        tokio_test::assert_pending!(waiting.poll());
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_ready!(waiting.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_is_granted() {
        let controller = SpeedController::new(100);
        let start = Instant::now();
        controller.acquire(1_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let controller = SpeedController::unlimited();

        let start = std::time::Instant::now();
        for _ in 0..100 {
            controller.acquire(10_000_000).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limit_switches_to_unlimited() {
        let controller = SpeedController::new(10);
        controller.acquire(10).await;
        controller.set_limit(0).await;

        let start = Instant::now();
        controller.acquire(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(controller.limit().await, 0);
    }
}
