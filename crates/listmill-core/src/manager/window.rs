//! Global sliding-window send limiter
//!
//! A coarse rolling limit applied across all campaigns: after each dispatch
//! the window counter is checked and, once the rate is reached, the sender
//! sleeps out the remainder of the window. This is deliberately not a token
//! bucket; brief bursts across a window boundary are allowed.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct WindowState {
    start: Instant,
    count: u64,
}

/// Sliding-window limiter shared by all send paths.
///
/// The `{start, count}` pair is serialized under a mutex; the sleep happens
/// after the guard is dropped, so concurrent senders can overshoot by at
/// most the worker count.
#[derive(Debug)]
pub struct SlidingWindow {
    active: bool,
    rate: u64,
    duration: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// The limiter is active only when enabled with a positive rate and a
    /// window longer than one second.
    pub fn new(enabled: bool, rate: u64, duration: Duration) -> Self {
        Self {
            active: enabled && rate > 0 && duration > Duration::from_secs(1),
            rate,
            duration,
            state: Mutex::new(WindowState {
                start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Whether the limiter does anything at all
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record one dispatch and sleep out the window if the rate is reached.
    pub async fn throttle(&self) {
        if !self.active {
            return;
        }

        let wait = {
            let mut state = self.state.lock().await;
            let elapsed = state.start.elapsed();

            if elapsed >= self.duration {
                state.start = Instant::now();
                state.count = 0;
                None
            } else {
                state.count += 1;
                if state.count >= self.rate {
                    state.count = 0;
                    Some(self.duration - elapsed)
                } else {
                    None
                }
            }
        };

        if let Some(wait) = wait {
            debug!(wait_ms = wait.as_millis() as u64, "Sliding window reached, sleeping");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_configurations() {
        assert!(!SlidingWindow::new(false, 10, Duration::from_secs(60)).is_active());
        assert!(!SlidingWindow::new(true, 0, Duration::from_secs(60)).is_active());
        assert!(!SlidingWindow::new(true, 10, Duration::from_secs(1)).is_active());
        assert!(SlidingWindow::new(true, 10, Duration::from_secs(60)).is_active());
    }

    #[tokio::test]
    async fn test_throttle_noop_when_inactive() {
        let window = SlidingWindow::new(false, 1, Duration::from_secs(600));
        // Would sleep ~10 minutes if the limiter were active.
        for _ in 0..100 {
            window.throttle().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sleeps_out_window() {
        let window = SlidingWindow::new(true, 3, Duration::from_secs(10));

        let before = Instant::now();
        for _ in 0..2 {
            window.throttle().await;
        }
        // No sleep until the rate is reached.
        assert_eq!(before.elapsed(), Duration::ZERO);

        // Third dispatch hits the rate and sleeps the window remainder.
        window.throttle().await;
        assert!(before.elapsed() >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_after_window_passes() {
        let window = SlidingWindow::new(true, 2, Duration::from_secs(5));
        window.throttle().await;

        tokio::time::advance(Duration::from_secs(6)).await;

        // A fresh window: the first dispatch only resets, the next two count.
        let before = Instant::now();
        window.throttle().await;
        window.throttle().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
