//! Sliding-window concurrency gate used to keep the GQL client under the
//! platform's per-second request budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

struct Inner {
    capacity: usize,
    window: Duration,
    total: usize,
    concurrent: usize,
    /// true while a timer task is armed to reset `total` back to zero
    timer_armed: bool,
}

/// A sliding-window rate limiter with two counters: `total` (requests issued
/// within the current window) and `concurrent` (currently in-flight).
/// `acquire()` blocks until `max(total, concurrent) < capacity`.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                window,
                total: 0,
                concurrent: 0,
                timer_armed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// The GQL client's default: capacity=5, window=1s. Do not tune without
    /// evidence — a higher cap has been observed to cause platform-side
    /// blocking of the whole account.
    pub fn gql_default() -> Self {
        Self::new(
            crate::constants::GQL_RATE_LIMIT_CAPACITY,
            crate::constants::GQL_RATE_LIMIT_WINDOW,
        )
    }

    /// Acquire a slot, blocking until one is available. The returned guard
    /// releases the `concurrent` slot (not `total`) on drop.
    pub async fn acquire(&self) -> RateLimitGuard {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.total.max(inner.concurrent) < inner.capacity {
                    inner.total += 1;
                    inner.concurrent += 1;
                    if !inner.timer_armed {
                        inner.timer_armed = true;
                        self.arm_timer(inner.window);
                    }
                    break;
                }
            }
            self.notify.notified().await;
        }
        RateLimitGuard {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
        }
    }

    fn arm_timer(&self, window: Duration) {
        let inner = self.inner.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut guard = inner.lock().await;
            guard.total = 0;
            guard.timer_armed = false;
            drop(guard);
            notify.notify_waiters();
        });
    }

    #[cfg(test)]
    async fn snapshot(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.total, inner.concurrent)
    }
}

/// Held while a request is in flight; dropping it frees a `concurrent` slot
/// and wakes waiters.
pub struct RateLimitGuard {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Drop for RateLimitGuard {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        let notify = self.notify.clone();
        // concurrent-- must happen even though Drop isn't async; spawn a
        // tiny task rather than blocking the dropping thread.
        tokio::spawn(async move {
            let mut guard = inner.lock().await;
            guard.concurrent = guard.concurrent.saturating_sub(1);
            let wake = guard.capacity.saturating_sub(guard.concurrent);
            drop(guard);
            for _ in 0..wake {
                notify.notify_one();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_capacity_concurrent_permits() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let mut guards = Vec::new();
        for _ in 0..5 {
            guards.push(limiter.acquire().await);
        }
        let (total, concurrent) = limiter.snapshot().await;
        assert_eq!(total, 5);
        assert_eq!(concurrent, 5);
    }

    #[tokio::test]
    async fn release_frees_a_concurrent_slot() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let g1 = limiter.acquire().await;
        let _g2 = limiter.acquire().await;
        drop(g1);
        // give the drop's spawned task a chance to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_total, concurrent) = limiter.snapshot().await;
        assert_eq!(concurrent, 1);
    }

    #[tokio::test]
    async fn sixth_acquire_within_window_waits_for_reset() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        let g1 = limiter.acquire().await;
        let g2 = limiter.acquire().await;
        drop(g1);
        drop(g2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // total is still 2 (only concurrent drained); a third acquire must
        // wait for the window timer to reset total to 0.
        let start = tokio::time::Instant::now();
        let _g3 = limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
