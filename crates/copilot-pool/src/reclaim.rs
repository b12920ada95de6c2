//! Background reclaim of exhausted tokens
//!
//! Rotation already reclaims on every pass, but an idle proxy never rotates.
//! This task keeps the active set (and `/health`) current while no requests
//! arrive.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::manager::TokenManager;

/// Spawn a task that reactivates expired exhausted tokens every `interval`.
///
/// Store errors are logged and retried on the next tick.
pub fn spawn_reclaim_task(
    manager: Arc<TokenManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the store was just opened
        ticker.tick().await;

        loop {
            ticker.tick().await;
            reclaim_cycle(&manager).await;
        }
    })
}

async fn reclaim_cycle(manager: &TokenManager) -> usize {
    match manager.reclaim_expired().await {
        Ok(0) => {
            debug!("no exhausted tokens due for reclaim");
            0
        }
        Ok(n) => {
            info!(reclaimed = n, "background reclaim reactivated tokens");
            n
        }
        Err(e) => {
            warn!(error = %e, "background reclaim failed, will retry next cycle");
            0
        }
    }
}
