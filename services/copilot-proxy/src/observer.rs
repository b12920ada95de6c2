//! Log and count each upstream attempt made by the dispatcher.

use copilot_client::{AttemptEvent, AttemptObserver, AttemptOutcome};
use tracing::{info, warn};

pub struct TracingObserver;

impl AttemptObserver for TracingObserver {
    fn on_attempt(&self, event: &AttemptEvent) {
        crate::metrics::record_attempt(event.outcome.label());

        let elapsed_ms = event.elapsed.as_millis() as u64;
        if !event.outcome.is_retry() {
            info!(
                attempt = event.attempt,
                token_id = event.token_id,
                outcome = ?event.outcome,
                elapsed_ms,
                "upstream attempt completed"
            );
            return;
        }
        match &event.outcome {
            AttemptOutcome::Transport(error) => warn!(
                attempt = event.attempt,
                token_id = event.token_id,
                error = %error,
                elapsed_ms,
                "upstream transport error"
            ),
            outcome => warn!(
                attempt = event.attempt,
                token_id = event.token_id,
                outcome = ?outcome,
                elapsed_ms,
                "upstream attempt failed"
            ),
        }
    }

    fn on_quota_report_failed(&self, token_id: u64, error: &str) {
        crate::metrics::record_quota_report_failure();
        warn!(token_id, error, "could not record reported quota");
    }
}
