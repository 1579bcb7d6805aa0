//! Bounded retry policy for read-modify-write cycles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay to wait after failed attempt number `attempt` (1-based).
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Retry immediately; used by tests and callers that pace themselves.
#[derive(Debug, Clone, Copy)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: impl Backoff + 'static) -> Self {
        Self { attempts: attempts.max(1), backoff: Arc::new(backoff) }
    }

    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, NoBackoff)
    }
}

impl Default for RetryPolicy {
    /// 5 attempts, 10ms apart.
    fn default() -> Self {
        Self::new(5, FixedBackoff(Duration::from_millis(10)))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").field("attempts", &self.attempts).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_client_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.attempts, 5);
        assert_eq!(p.backoff.delay(1), Duration::from_millis(10));
        assert_eq!(p.backoff.delay(4), Duration::from_millis(10));
    }

    #[test]
    fn closures_are_backoffs() {
        let p = RetryPolicy::new(3, |attempt: u32| Duration::from_millis(5 * attempt as u64));
        assert_eq!(p.backoff.delay(2), Duration::from_millis(10));
        assert_eq!(RetryPolicy::immediate(0).attempts, 1);
        assert!(RetryPolicy::immediate(2).backoff.delay(1).is_zero());
    }
}
