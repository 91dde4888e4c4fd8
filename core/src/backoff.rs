//! Backoff between attempts at transient backend operations.
//!
//! Reader loops use a [`BackoffPolicy`] after a failed read, connect or
//! provisioning attempt. The default is a fixed 10 second delay.
//!
//! # Example
//!
//! ```rust
//! use dddbus_core::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
//! ```

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default delay after a transient backend error.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Delay policy for retrying transient failures.
///
/// # Default Values
///
/// - `initial_delay`: 10 seconds
/// - `max_delay`: 10 seconds
/// - `multiplier`: 1.0 (fixed delay)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_BACKOFF)
    }
}

impl BackoffPolicy {
    /// Same delay for every attempt.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Calculate delay for a given attempt number (zero-based).
    ///
    /// delay = `initial_delay` * (multiplier ^ attempt), capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt.min(64) as i32);
        let delay = Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64);

        delay.min(self.max_delay)
    }

    /// Sleep for the delay of `attempt`, waking early on cancellation.
    ///
    /// Returns `false` if `cancel` fired before the delay elapsed.
    pub async fn sleep_or_cancel(&self, attempt: usize, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.delay_for_attempt(attempt)) => true,
        }
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl BackoffPolicyBuilder {
    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set growth factor per attempt.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let initial_delay = self.initial_delay.unwrap_or(DEFAULT_BACKOFF);
        BackoffPolicy {
            initial_delay,
            max_delay: self.max_delay.unwrap_or(initial_delay).max(initial_delay),
            multiplier: self.multiplier.unwrap_or(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_ten_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = BackoffPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .multiplier(2.0)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancellation() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(10));
        assert!(policy.sleep_or_cancel(0, &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(3600));
        let token = CancellationToken::new();
        token.cancel();

        assert!(!policy.sleep_or_cancel(0, &token).await);
    }
}
