//! Exponential-with-jitter backoff, shared by the HTTP client, the GQL client
//! and websocket reconnection.

use std::time::Duration;

use rand::Rng;

/// A stateful backoff iterator.
///
/// Each call to [`Backoff::next_delay`] yields
/// `min(base^steps * U(1-v_min, 1+v_max) + shift, maximum)` and advances
/// `steps`. `reset()` returns the step counter to zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: f64,
    steps: u32,
    shift: f64,
    v_min: f64,
    v_max: f64,
    maximum: Duration,
}

impl Backoff {
    /// Construct a new backoff. `base` must be strictly greater than 1.
    pub fn new(base: f64, shift_secs: f64, jitter: f64, maximum: Duration) -> Self {
        assert!(base > 1.0, "backoff base must be > 1");
        Self {
            base,
            steps: 0,
            shift: shift_secs,
            v_min: jitter,
            v_max: jitter,
            maximum,
        }
    }

    /// Build the backoff used for HTTP retries and websocket reconnects:
    /// base 4, no shift, +/-10% jitter, capped at `maximum`.
    pub fn standard(maximum: Duration) -> Self {
        Self::new(4.0, 0.0, 0.1, maximum)
    }

    /// Build the backoff used for GQL transient retries: base 2, capped at
    /// `maximum`, 30% jitter so a handful of clients retrying in lockstep
    /// spread out.
    pub fn gql(maximum: Duration) -> Self {
        Self::new(2.0, 0.0, 0.3, maximum)
    }

    pub fn reset(&mut self) {
        self.steps = 0;
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Compute and advance to the next delay.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.base.powi(self.steps as i32);
        let jitter = rand::thread_rng().gen_range((1.0 - self.v_min)..=(1.0 + self.v_max));
        let secs = (raw * jitter + self.shift).max(0.0);
        self.steps += 1;
        Duration::from_secs_f64(secs).min(self.maximum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "backoff base must be > 1")]
    fn rejects_base_at_or_below_one() {
        Backoff::new(1.0, 0.0, 0.1, Duration::from_secs(60));
    }

    #[test]
    fn steps_advance_and_reset() {
        let mut b = Backoff::standard(Duration::from_secs(180));
        assert_eq!(b.steps(), 0);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.steps(), 2);
        b.reset();
        assert_eq!(b.steps(), 0);
    }

    #[test]
    fn delay_is_capped_at_maximum() {
        let maximum = Duration::from_secs(5);
        let mut b = Backoff::new(4.0, 0.0, 0.1, maximum);
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d <= maximum);
        }
    }

    #[test]
    fn delay_grows_with_steps_before_capping() {
        let mut b = Backoff::new(4.0, 0.0, 0.0, Duration::from_secs(3600));
        let first = b.next_delay();
        let second = b.next_delay();
        assert!(second > first);
    }
}
