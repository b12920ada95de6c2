//! Quota interpretation for Copilot responses
//!
//! The upstream reports remaining allowance as `limited_user_quotas` (a map of
//! category to remaining count) and the next reset as
//! `limited_user_reset_date`. Both are optional; a missing category means
//! "not limited" and a missing reset date falls back to a configured window.

use std::time::Duration;

use copilot_auth::{QuotaSnapshot, unix_now};
use serde_json::Value;

/// How an upstream HTTP status should be handled by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retry with the same token after a backoff.
    Transient,
    /// The token's quota is spent; retire it or rotate away.
    QuotaExceeded,
    /// The token was refused; rotate away.
    Unauthorized,
    /// The request itself was refused; hand the response back to the caller.
    Rejected,
}

/// Classify an upstream status code.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        401 | 403 => ErrorClassification::Unauthorized,
        429 => ErrorClassification::QuotaExceeded,
        408 | 500..=599 => ErrorClassification::Transient,
        _ => ErrorClassification::Rejected,
    }
}

/// Pure quota policy. Built once from config, shared read-only.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    monitored: Vec<String>,
    default_reset_window: Duration,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(vec!["chat".to_string()], Duration::from_secs(3600))
    }
}

impl QuotaTracker {
    pub fn new(monitored: Vec<String>, default_reset_window: Duration) -> Self {
        Self {
            monitored,
            default_reset_window,
        }
    }

    pub fn monitored(&self) -> &[String] {
        &self.monitored
    }

    /// True iff some monitored category is present and at zero.
    ///
    /// An absent category counts as available. A token is only retired on
    /// positive evidence of exhaustion.
    pub fn is_exhausted(&self, snapshot: &QuotaSnapshot) -> bool {
        self.monitored
            .iter()
            .any(|category| snapshot.get(category) == Some(0))
    }

    /// Extract `limited_user_quotas` from a response payload.
    ///
    /// Returns `None` when the payload carries no quota object. Non-numeric
    /// entries are dropped. Fractional counts round up, so only a true zero
    /// reads as spent.
    pub fn snapshot_of(&self, payload: &Value) -> Option<QuotaSnapshot> {
        let quotas = payload.get("limited_user_quotas")?.as_object()?;
        Some(
            quotas
                .iter()
                .filter_map(|(category, remaining)| {
                    let remaining = remaining.as_i64().or_else(|| {
                        remaining
                            .as_f64()
                            .filter(|f| f.is_finite())
                            .map(|f| f.ceil() as i64)
                    })?;
                    Some((category.as_str(), remaining))
                })
                .collect(),
        )
    }

    /// Reset instant (unix seconds) announced by the payload, or now plus the
    /// default window.
    pub fn reset_time_of(&self, payload: &Value) -> u64 {
        self.reset_time_at(payload, unix_now())
    }

    /// Reset instant for a response that said nothing about it.
    pub fn fallback_reset(&self) -> u64 {
        unix_now() + self.default_reset_window.as_secs()
    }

    fn reset_time_at(&self, payload: &Value, now: u64) -> u64 {
        payload
            .get("limited_user_reset_date")
            .and_then(parse_reset_date)
            .unwrap_or(now + self.default_reset_window.as_secs())
    }
}

/// Accepts unix seconds (number or numeric string), RFC 3339, or `YYYY-MM-DD`.
fn parse_reset_date(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<u64>() {
                return Some(secs);
            }
            if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(s) {
                return u64::try_from(ts.timestamp()).ok();
            }
            let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
            let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
            u64::try_from(midnight.timestamp()).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(v: Value) -> QuotaSnapshot {
        QuotaTracker::default().snapshot_of(&json!({"limited_user_quotas": v})).unwrap()
    }

    #[test]
    fn exhausted_when_chat_is_zero() {
        assert!(QuotaTracker::default().is_exhausted(&snapshot(json!({"chat": 0}))));
    }

    #[test]
    fn not_exhausted_when_chat_remaining() {
        assert!(!QuotaTracker::default().is_exhausted(&snapshot(json!({"chat": 5}))));
    }

    #[test]
    fn missing_category_is_not_exhausted() {
        assert!(!QuotaTracker::default().is_exhausted(&snapshot(json!({}))));
        assert!(!QuotaTracker::default().is_exhausted(&snapshot(json!({"completions": 0}))));
    }

    #[test]
    fn any_monitored_category_at_zero_exhausts() {
        let tracker = QuotaTracker::new(
            vec!["chat".into(), "completions".into()],
            Duration::from_secs(60),
        );
        assert!(tracker.is_exhausted(&snapshot(json!({"chat": 3, "completions": 0}))));
        assert!(!tracker.is_exhausted(&snapshot(json!({"chat": 3, "completions": 1}))));
    }

    #[test]
    fn negative_remaining_is_not_zero() {
        assert!(!QuotaTracker::default().is_exhausted(&snapshot(json!({"chat": -1}))));
    }

    #[test]
    fn snapshot_drops_non_numeric_values() {
        let s = snapshot(json!({"chat": 4, "plan": "free", "completions": 2.0}));
        assert_eq!(s.get("chat"), Some(4));
        assert_eq!(s.get("completions"), Some(2));
        assert_eq!(s.get("plan"), None);
    }

    #[test]
    fn fractional_remaining_rounds_up() {
        let tracker = QuotaTracker::default();
        let s = snapshot(json!({"chat": 0.5}));
        assert_eq!(s.get("chat"), Some(1));
        assert!(!tracker.is_exhausted(&s));

        assert_eq!(snapshot(json!({"chat": 2.25})).get("chat"), Some(3));
        assert!(tracker.is_exhausted(&snapshot(json!({"chat": 0.0}))));
    }

    #[test]
    fn snapshot_absent_without_quota_object() {
        let tracker = QuotaTracker::default();
        assert!(tracker.snapshot_of(&json!({"token": "x"})).is_none());
        assert!(tracker.snapshot_of(&json!({"limited_user_quotas": null})).is_none());
    }

    #[test]
    fn reset_from_unix_seconds() {
        let tracker = QuotaTracker::default();
        let payload = json!({"limited_user_reset_date": 1_900_000_000u64});
        assert_eq!(tracker.reset_time_at(&payload, 0), 1_900_000_000);
        let payload = json!({"limited_user_reset_date": "1900000000"});
        assert_eq!(tracker.reset_time_at(&payload, 0), 1_900_000_000);
    }

    #[test]
    fn reset_from_rfc3339() {
        let payload = json!({"limited_user_reset_date": "2025-01-01T00:00:00Z"});
        assert_eq!(
            QuotaTracker::default().reset_time_at(&payload, 0),
            1_735_689_600
        );
    }

    #[test]
    fn reset_from_calendar_date() {
        let payload = json!({"limited_user_reset_date": "2025-01-01"});
        assert_eq!(
            QuotaTracker::default().reset_time_at(&payload, 0),
            1_735_689_600
        );
    }

    #[test]
    fn reset_falls_back_to_default_window() {
        let tracker = QuotaTracker::new(vec!["chat".into()], Duration::from_secs(900));
        assert_eq!(tracker.reset_time_at(&json!({}), 1_000), 1_900);
        let garbage = json!({"limited_user_reset_date": "next tuesday"});
        assert_eq!(tracker.reset_time_at(&garbage, 1_000), 1_900);
    }

    #[test]
    fn classify_status_401_unauthorized() {
        assert_eq!(classify_status(401), ErrorClassification::Unauthorized);
    }

    #[test]
    fn classify_status_403_unauthorized() {
        assert_eq!(classify_status(403), ErrorClassification::Unauthorized);
    }

    #[test]
    fn classify_status_429_quota() {
        assert_eq!(classify_status(429), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn classify_status_408_and_5xx_transient() {
        assert_eq!(classify_status(408), ErrorClassification::Transient);
        assert_eq!(classify_status(500), ErrorClassification::Transient);
        assert_eq!(classify_status(503), ErrorClassification::Transient);
    }

    #[test]
    fn classify_status_other_4xx_rejected() {
        assert_eq!(classify_status(400), ErrorClassification::Rejected);
        assert_eq!(classify_status(404), ErrorClassification::Rejected);
        assert_eq!(classify_status(422), ErrorClassification::Rejected);
    }
}
