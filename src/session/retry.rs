// SPDX-License-Identifier: MIT

//! Error classification and retry delays

use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::SessionError;

/// How a failed remote call should be handled
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// No response or 5xx: keep locally, retry with backoff
    Transient,
    /// 429: retry after the suggested delay
    RateLimited { retry_after: Option<Duration> },
    /// Semantic 4xx: surface to the user, never retry automatically
    Rejected {
        message: String,
        step_errors: BTreeMap<String, Vec<String>>,
    },
    /// Session is gone; needs re-initialization
    SessionExpired,
}

impl SessionError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            SessionError::Network(_) => ErrorClass::Transient,
            // A garbled body usually means a proxy or a half-deployed server
            SessionError::Decode(_) => ErrorClass::Transient,
            SessionError::Status {
                status,
                message,
                retry_after,
                step_errors,
            } => match *status {
                429 => ErrorClass::RateLimited {
                    retry_after: *retry_after,
                },
                401 | 403 | 404 | 410 => ErrorClass::SessionExpired,
                408 => ErrorClass::Transient,
                400..=499 => ErrorClass::Rejected {
                    message: message.clone(),
                    step_errors: step_errors.clone(),
                },
                _ => ErrorClass::Transient,
            },
        }
    }
}

/// Exponential backoff with full jitter, bounded by `max`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Upper bound of the delay for the given attempt (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay in `[base/2, ceiling]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let floor = (self.base / 2).min(ceiling);
        if ceiling <= floor {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(floor.as_millis()..=ceiling.as_millis());
        Duration::from_millis(millis as u64)
    }

    /// Delay honoring a server hint, clamped to `max`
    pub fn after_hint(&self, hint: Option<Duration>, attempt: u32) -> Duration {
        match hint {
            Some(d) => d.min(self.max),
            None => self.delay(attempt),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_statuses() {
        assert_eq!(
            SessionError::network("down").classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            SessionError::status(503, "busy").classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            SessionError::rate_limited(Some(Duration::from_secs(2))).classify(),
            ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(
            SessionError::status(404, "gone").classify(),
            ErrorClass::SessionExpired
        );
        assert_eq!(
            SessionError::status(410, "expired").classify(),
            ErrorClass::SessionExpired
        );
        assert!(matches!(
            SessionError::status(422, "bad").classify(),
            ErrorClass::Rejected { .. }
        ));
    }

    #[test]
    fn test_backoff_ceiling_grows_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.ceiling(0), Duration::from_secs(5));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(10));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(20));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(40), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_delay_within_bounds() {
        let backoff = Backoff::default();
        for attempt in 0..6 {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_millis(2_500));
            assert!(delay <= backoff.ceiling(attempt));
        }
    }

    #[test]
    fn test_hint_is_clamped() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.after_hint(Some(Duration::from_secs(3)), 0),
            Duration::from_secs(3)
        );
        assert_eq!(
            backoff.after_hint(Some(Duration::from_secs(300)), 0),
            Duration::from_secs(30)
        );
    }
}
