use std::time::Duration;

/// Reconnection schedule: doubling delays from `initial_delay`, capped at
/// `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(initial_delay_ms)),
            max_attempts,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the zero-based reconnection `attempt` is still within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait before the zero-based reconnection `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Every delay the policy allows, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 5_000, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn default_schedule_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule().collect::<Vec<_>>(),
            millis(&[1_000, 2_000, 4_000, 5_000, 5_000])
        );
    }

    #[test]
    fn budget_counts_scheduled_attempts() {
        let policy = RetryPolicy::new(10, 20, 2);
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(1));
        assert!(!policy.allows_attempt(2));
        assert_eq!(RetryPolicy::new(10, 10, 0).schedule().count(), 0);
    }

    #[test]
    fn large_attempts_saturate_at_max_delay() {
        let policy = RetryPolicy::new(250, 8_000, u32::MAX);
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(8_000));
    }

    #[test]
    fn max_delay_never_drops_below_initial() {
        let policy = RetryPolicy::new(3_000, 1_000, 1);
        assert_eq!(policy.max_delay(), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(3));
    }
}
