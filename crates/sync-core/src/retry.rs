use std::time::Duration;

/// Reconnection schedule for the push connection.
///
/// Every attempt waits the same delay. `max_attempts` bounds the number of
/// consecutive failed attempts before reconnection is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn fixed(delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            delay_ms,
            max_attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// `attempt` is zero-based: the first reconnect after a drop is attempt 0.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3_000, 10)
    }
}
