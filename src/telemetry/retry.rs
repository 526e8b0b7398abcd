//! # Retry policy for telemetry sends.
//!
//! [`RetryPolicy`] bounds attempts per send and controls how the delay
//! between attempts grows:
//! - [`RetryPolicy::first`] the initial delay;
//! - [`RetryPolicy::factor`] the multiplicative growth factor;
//! - [`RetryPolicy::max`] the delay cap;
//! - [`RetryPolicy::jitter`] randomization to avoid synchronized retries
//!   across a fleet of gateways hitting the same endpoint.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use edgevisor::{Jitter, RetryPolicy};
//!
//! let policy = RetryPolicy {
//!     max_attempts: 3,
//!     first: Duration::from_secs(2),
//!     max: Duration::from_secs(30),
//!     factor: 2.0,
//!     jitter: Jitter::None,
//! };
//!
//! // First retry uses `first`, then the delay doubles, capped at `max`.
//! assert_eq!(policy.next(None), Duration::from_secs(2));
//! assert_eq!(policy.next(Some(Duration::from_secs(2))), Duration::from_secs(4));
//! assert_eq!(policy.next(Some(Duration::from_secs(20))), Duration::from_secs(30));
//! ```

use std::time::Duration;

use rand::Rng;

/// Randomization applied to retry delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter: exact computed delay.
    None,
    /// Random delay in `[0, delay]`; most aggressive spreading.
    Full,
    /// `delay/2 + random[0, delay/2]`; balanced (default).
    #[default]
    Equal,
}

impl Jitter {
    /// Applies this jitter to a computed delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = (delay.as_millis().min(u128::from(u64::MAX))) as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                Duration::from_millis(half + jitter)
            }
        }
    }
}

/// Bounded exponential backoff for the send pipeline.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Attempts per send (including the first).
    pub max_attempts: u32,
    /// Initial delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Jitter applied after capping.
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    /// Returns the pipeline defaults: 3 attempts, 2 s initial delay,
    /// doubling, capped at 30 s, equal jitter.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first: Duration::from_secs(2),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: Jitter::default(),
        }
    }
}

impl RetryPolicy {
    /// Computes the next delay from the previous one.
    ///
    /// - `None` → `first`, clamped to `max`.
    /// - `Some(d)` → `d * factor`, clamped to `max`.
    ///
    /// Jitter is applied after clamping, so the returned value never
    /// exceeds `max`.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let unclamped = match prev {
            None => self.first,
            Some(d) => {
                let grown = d.as_secs_f64() * self.factor;
                if !grown.is_finite() {
                    self.max
                } else {
                    d.mul_f64(self.factor)
                }
            }
        };
        self.jitter.apply(unclamped.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: Jitter) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn delays_double_until_cap() {
        let p = policy(Jitter::None);
        let d1 = p.next(None);
        let d2 = p.next(Some(d1));
        let d3 = p.next(Some(d2));
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(400));
        assert_eq!(p.next(Some(Duration::from_secs(8))), Duration::from_secs(10));
    }

    #[test]
    fn first_delay_is_clamped() {
        let p = RetryPolicy {
            first: Duration::from_secs(60),
            ..policy(Jitter::None)
        };
        assert_eq!(p.next(None), Duration::from_secs(10));
    }

    #[test]
    fn full_jitter_stays_in_bounds() {
        let p = policy(Jitter::Full);
        for _ in 0..100 {
            let d = p.next(Some(Duration::from_secs(4)));
            assert!(d <= Duration::from_secs(8));
        }
    }

    #[test]
    fn equal_jitter_preserves_half() {
        let p = policy(Jitter::Equal);
        for _ in 0..100 {
            let d = p.next(Some(Duration::from_secs(4)));
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(8));
        }
    }
}
