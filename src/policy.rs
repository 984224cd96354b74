//! Failure classification and retry budget for the bind channel.

use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::Failure;

/// How a failed exchange should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Token rejected: refresh it, then handshake again.
    AuthExpired,
    /// Screen or session no longer exists: terminal `NotLinked`.
    NotFound,
    /// Worth retrying after a backoff. With `rebind` the channel itself is
    /// gone (`Unknown SID`, `410 Gone`) and a new handshake is needed.
    Transient { rebind: bool },
}

/// Bounded exponential backoff: `base * 2^(attempt-1)`, clamped to `max`,
/// at most `max_attempts` consecutive failures.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts: max_attempts.max(1),
            attempts: 0,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_attempts,
        )
    }

    pub(crate) fn classify(failure: &Failure) -> FailureClass {
        match failure {
            Failure::Status { status: 401 | 403, .. } => FailureClass::AuthExpired,
            Failure::Status { status: 404, .. } => FailureClass::NotFound,
            Failure::Status { status: 410, .. } => FailureClass::Transient { rebind: true },
            Failure::Status { status, .. } if (400..500).contains(status) => {
                // `400 Unknown SID` and friends: the channel id is no longer valid.
                FailureClass::Transient { rebind: true }
            }
            Failure::Status { .. } => FailureClass::Transient { rebind: false },
            Failure::Transport(_) | Failure::Decode(_) => FailureClass::Transient { rebind: false },
        }
    }

    /// Count one more consecutive failure. Returns the delay to wait before
    /// the next attempt, or `None` once the budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        Some(self.delay_for(self.attempts))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Back to baseline after a successful poll.
    pub fn reset(&mut self) {
        if self.attempts > 0 {
            tracing::debug!("[lounge] retry budget reset after {} failures", self.attempts);
        }
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DecodeError;
    use crate::transport::{TransportError, TransportErrorKind};

    fn status(status: u16, body: &str) -> Failure {
        Failure::Status {
            status,
            body: body.into(),
        }
    }

    #[test]
    fn classification() {
        assert_eq!(ReconnectPolicy::classify(&status(401, "Expired")), FailureClass::AuthExpired);
        assert_eq!(ReconnectPolicy::classify(&status(403, "")), FailureClass::AuthExpired);
        assert_eq!(ReconnectPolicy::classify(&status(404, "")), FailureClass::NotFound);
        assert_eq!(
            ReconnectPolicy::classify(&status(400, "Unknown SID")),
            FailureClass::Transient { rebind: true }
        );
        assert_eq!(
            ReconnectPolicy::classify(&status(410, "Gone")),
            FailureClass::Transient { rebind: true }
        );
        assert_eq!(
            ReconnectPolicy::classify(&status(503, "")),
            FailureClass::Transient { rebind: false }
        );
        let io = Failure::Transport(TransportError::new(TransportErrorKind::Io, "reset"));
        assert_eq!(ReconnectPolicy::classify(&io), FailureClass::Transient { rebind: false });
        let decode = Failure::Decode(DecodeError::BadLength("x".into()));
        assert_eq!(ReconnectPolicy::classify(&decode), FailureClass::Transient { rebind: false });
    }

    #[test]
    fn budget_of_four_allows_three_growing_retries() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 4);
        let delays: Vec<_> = (0..3).map(|_| policy.record_failure().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000)
            ]
        );
        assert_eq!(policy.record_failure(), None);
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(3), 50);
        assert_eq!(policy.delay_for(10), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn reset_restores_baseline() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 4);
        policy.record_failure();
        policy.record_failure();
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(100)));
    }
}
