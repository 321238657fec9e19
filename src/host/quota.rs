//!
//! Thread-safe accounting of a remote device's free input-buffer space.
//!

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::error::QuotaError;

/// Default assumed device buffer capacity in bytes (matches a typical Grbl buffer).
pub const DEFAULT_MAX_BYTES: usize = 127;

struct QuotaState {
    free_bytes: usize,
    in_flight: VecDeque<usize>,
}

///
/// Thread-safe device buffer memory reservation system.
///
/// Tracks the available buffer space on a remote device to prevent buffer overflows.
/// It blocks producers when the buffer is full and releases space when commands are
/// acknowledged, errored, resent, or when the host is reset.
///
pub struct QuotaTracker {
    state: Mutex<QuotaState>,
    notify: Notify,
    max_bytes: usize,
}

impl QuotaTracker {
    ///
    /// Creates a new tracker with the default capacity (127 bytes).
    ///
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_BYTES)
    }

    ///
    /// Creates a new tracker with the given total buffer capacity.
    ///
    /// # Panics
    /// Panics if `max_bytes` is zero; construction-time capacity is a programmer
    /// error, unlike the per-call validation in `consume`.
    ///
    pub fn with_capacity(max_bytes: usize) -> Self {
        assert!(max_bytes > 0, "'max_bytes' must be positive");

        QuotaTracker {
            state: Mutex::new(QuotaState { free_bytes: max_bytes, in_flight: VecDeque::new() }),
            notify: Notify::new(),
            max_bytes,
        }
    }

    ///
    /// Reserves memory for a write operation.
    ///
    /// Blocks until sufficient buffer space is available or the timeout expires.
    ///
    /// # Parameters:
    /// - `size`: Number of bytes to reserve.
    /// - `timeout`: Maximum time to wait.
    ///
    /// # Returns:
    /// - `Ok(())` once the reservation is recorded.
    /// - `QuotaError::InvalidSize` if `size` is zero or exceeds total capacity.
    /// - `QuotaError::InvalidTimeout` if `timeout` is not positive.
    /// - `QuotaError::ConsumeTimeout` if the reservation cannot be fulfilled in time.
    ///
    pub async fn consume(&self, size: usize, timeout: Duration) -> Result<(), QuotaError> {
        if size == 0 || size > self.max_bytes {
            return Err(QuotaError::InvalidSize { size, max_bytes: self.max_bytes });
        }

        if timeout.is_zero() {
            return Err(QuotaError::InvalidTimeout);
        }

        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.free_bytes >= size {
                    state.free_bytes -= size;
                    state.in_flight.push_back(size);
                    return Ok(());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QuotaError::ConsumeTimeout);
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(QuotaError::ConsumeTimeout);
            }
        }
    }

    ///
    /// Releases memory for the oldest in-flight reservation.
    ///
    /// Should be called when a command has been acknowledged, errored, resent, or
    /// when the device is known to have discarded it. A no-op if nothing is in flight.
    ///
    pub async fn reclaim(&self) {
        let mut state = self.state.lock().await;

        if let Some(size) = state.in_flight.pop_front() {
            state.free_bytes += size;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    ///
    /// Blocks until all in-flight reservations have been reclaimed.
    ///
    pub async fn join(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                if state.in_flight.is_empty() {
                    return;
                }
            }

            notified.await;
        }
    }

    ///
    /// Resets the quota state: clears all in-flight tracking and restores full
    /// capacity. Used after a device reset or fault.
    ///
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        state.in_flight.clear();
        state.free_bytes = self.max_bytes;
        drop(state);
        self.notify.notify_waiters();
    }

    ///
    /// Reports whether any reservation is currently in flight.
    ///
    pub async fn pending(&self) -> bool {
        !self.state.lock().await.in_flight.is_empty()
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn initialization() {
        let tracker = QuotaTracker::new();
        let state = tracker.state.lock().await;
        assert_eq!(state.free_bytes, 127);
        assert_eq!(state.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn consume_quota() {
        let tracker = QuotaTracker::with_capacity(100);
        tracker.consume(50, Duration::from_secs(1)).await.unwrap();
        let state = tracker.state.lock().await;
        assert_eq!(state.free_bytes, 50);
        assert_eq!(state.in_flight.len(), 1);
        assert_eq!(state.in_flight[0], 50);
    }

    #[tokio::test]
    async fn reclaim() {
        let tracker = QuotaTracker::with_capacity(100);
        tracker.consume(30, Duration::from_secs(1)).await.unwrap();
        tracker.consume(20, Duration::from_secs(1)).await.unwrap();
        assert_eq!(tracker.state.lock().await.free_bytes, 50);

        tracker.reclaim().await;
        assert_eq!(tracker.state.lock().await.free_bytes, 80);

        tracker.reclaim().await;
        assert_eq!(tracker.state.lock().await.free_bytes, 100);
    }

    #[tokio::test]
    async fn reclaim_empty() {
        let tracker = QuotaTracker::with_capacity(100);
        tracker.reclaim().await;
        assert_eq!(tracker.state.lock().await.free_bytes, 100);
    }

    #[tokio::test]
    async fn flush() {
        let tracker = QuotaTracker::with_capacity(100);
        tracker.consume(50, Duration::from_secs(1)).await.unwrap();
        tracker.flush().await;
        let state = tracker.state.lock().await;
        assert_eq!(state.free_bytes, 100);
        assert_eq!(state.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn consume_blocks_until_reclaimed() {
        let tracker = Arc::new(QuotaTracker::with_capacity(100));
        tracker.consume(100, Duration::from_secs(1)).await.unwrap();

        let reclaimer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reclaimer.reclaim().await;
        });

        tracker.consume(10, Duration::from_secs(1)).await.unwrap();
        let state = tracker.state.lock().await;
        assert_eq!(state.free_bytes, 90);
        assert_eq!(state.in_flight.len(), 1);
        assert_eq!(state.in_flight[0], 10);
    }

    #[tokio::test]
    async fn join_blocks_until_drained() {
        let tracker = Arc::new(QuotaTracker::with_capacity(100));
        tracker.consume(50, Duration::from_secs(1)).await.unwrap();

        let reclaimer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reclaimer.reclaim().await;
        });

        tracker.join().await;
        let state = tracker.state.lock().await;
        assert_eq!(state.free_bytes, 100);
        assert_eq!(state.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn consume_invalid_size() {
        let tracker = QuotaTracker::with_capacity(100);
        assert!(matches!(
            tracker.consume(0, Duration::from_secs(1)).await,
            Err(QuotaError::InvalidSize { .. })
        ));
        assert!(matches!(
            tracker.consume(101, Duration::from_secs(1)).await,
            Err(QuotaError::InvalidSize { .. })
        ));
    }

    #[tokio::test]
    async fn consume_invalid_timeout() {
        let tracker = QuotaTracker::with_capacity(100);
        assert!(matches!(
            tracker.consume(10, Duration::from_secs(0)).await,
            Err(QuotaError::InvalidTimeout)
        ));
    }

    #[tokio::test]
    async fn consume_timeout() {
        let tracker = QuotaTracker::with_capacity(100);
        tracker.consume(100, Duration::from_secs(1)).await.unwrap();

        let start = Instant::now();
        let result = tracker.consume(1, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(QuotaError::ConsumeTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
