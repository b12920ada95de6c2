//! Per-attempt events
//!
//! The client has no logging sink of its own. Each attempt is described by an
//! `AttemptEvent` handed to an injected `AttemptObserver`; the host decides
//! whether that becomes a log line, a metric, or nothing.

use std::time::Duration;

/// What happened on one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx, returned to the caller.
    Success(u16),
    /// Non-retryable status, returned to the caller.
    Rejected(u16),
    /// 408 or 5xx. Retried on the same token after a backoff.
    Transient(u16),
    /// Connect failure, timeout or truncated body. Retried after a backoff.
    Transport(String),
    /// 401/403. Rotated to another token.
    Unauthorized(u16),
    /// 429 or a spent quota. Token retired or rotated away.
    QuotaExceeded(u16),
}

impl AttemptOutcome {
    /// Low-cardinality label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::Rejected(_) => "rejected",
            AttemptOutcome::Transient(_) => "transient",
            AttemptOutcome::Transport(_) => "transport",
            AttemptOutcome::Unauthorized(_) => "unauthorized",
            AttemptOutcome::QuotaExceeded(_) => "quota_exceeded",
        }
    }

    /// Whether the client will make another attempt after this one (if the
    /// ceiling allows).
    pub fn is_retry(&self) -> bool {
        !matches!(self, AttemptOutcome::Success(_) | AttemptOutcome::Rejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    /// 1-based.
    pub attempt: u32,
    pub token_id: u64,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, event: &AttemptEvent);

    /// Quota carried in a response could not be recorded. The request itself
    /// carries on.
    fn on_quota_report_failed(&self, _token_id: u64, _error: &str) {}
}

/// Discards every event.
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {
    fn on_attempt(&self, _event: &AttemptEvent) {}
}
