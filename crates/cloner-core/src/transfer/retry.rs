//! Retry bound and overall deadline.

use std::time::{Duration, Instant};

use crate::error::{ClonerError, Result};

/// How many times a chunk may be retried after its first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Whether another attempt is allowed after `retries` retries.
    pub fn allows(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Wall-clock limit for a whole operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn is_expired(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    /// Fails with `Timeout` once the limit has passed.
    pub fn check(&self) -> Result<()> {
        match self.limit {
            Some(limit) if self.is_expired() => Err(ClonerError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::new(3);
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert_eq!(policy.max_attempts(), 4);
        assert!(!RetryPolicy::new(0).allows(0));
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::unlimited().check().is_ok());
        assert!(Deadline::new(Some(Duration::from_secs(3600))).check().is_ok());

        let expired = Deadline::new(Some(Duration::ZERO));
        assert!(expired.is_expired());
        assert_eq!(expired.check().unwrap_err().kind(), ErrorKind::Timeout);
    }
}
