//! In-memory index over the token store
//!
//! The store directory is the source of truth; `index` is refreshed from it on
//! every `list_active()`. Cached quota snapshots and their reported reset
//! times live here only and are dropped when a token is reclaimed or removed.
//!
//! `TokenPool` is not internally synchronized. `TokenManager` owns it behind
//! its single lock.

use std::collections::HashMap;
use std::sync::Arc;

use copilot_auth::{ExhaustedEntry, QuotaSnapshot, TokenRecord, TokenStore};
use tracing::{debug, info, warn};

use crate::error::Result;

pub struct TokenPool {
    store: Arc<TokenStore>,
    /// Active ids, ascending. Refreshed by `list_active()`.
    index: Vec<u64>,
    /// Last reported snapshot per id, with its reset time if one was given.
    quotas: HashMap<u64, (QuotaSnapshot, Option<u64>)>,
}

impl TokenPool {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self {
            store,
            index: Vec::new(),
            quotas: HashMap::new(),
        }
    }

    /// Rescan the active set, ordered by ascending id, with cached quotas and
    /// their reset times attached.
    ///
    /// Corrupt entries are logged by the store and left out.
    pub async fn list_active(&mut self) -> Result<Vec<TokenRecord>> {
        let scan = self.store.scan_active().await?;
        if !scan.corrupt.is_empty() {
            debug!(corrupt = scan.corrupt.len(), "active scan skipped entries");
        }

        let mut records = scan.entries;
        for record in &mut records {
            if let Some((snapshot, reset_at)) = self.quotas.get(&record.id) {
                record.cached_quota = Some(snapshot.clone());
                record.quota_reset_at = *reset_at;
            }
        }
        self.index = records.iter().map(|r| r.id).collect();
        Ok(records)
    }

    pub async fn list_exhausted(&self) -> Result<Vec<ExhaustedEntry>> {
        Ok(self.store.scan_exhausted().await?.entries)
    }

    /// Move a token to the exhausted set until `reset_at` (unix seconds).
    ///
    /// Calling it again for an exhausted token only refreshes `reset_at`.
    pub async fn mark_exhausted(&mut self, id: u64, reset_at: u64) -> Result<()> {
        self.store.exhaust(id, reset_at).await?;
        self.index.retain(|&i| i != id);
        metrics::counter!("copilot_pool_exhausted_total").increment(1);
        info!(token_id = id, reset_at, "token marked exhausted");
        Ok(())
    }

    /// Reactivate every exhausted token whose reset time is at or before `now`.
    ///
    /// A token that fails to move is logged and left for the next pass.
    pub async fn reclaim_expired(&mut self, now: u64) -> Result<usize> {
        let mut reclaimed = 0;
        for entry in self.list_exhausted().await? {
            if entry.reset_at > now {
                continue;
            }
            match self.store.reactivate(entry.id).await {
                Ok(()) => {
                    self.quotas.remove(&entry.id);
                    reclaimed += 1;
                    info!(token_id = entry.id, reset_at = entry.reset_at, "token reclaimed");
                }
                Err(e) => {
                    warn!(token_id = entry.id, error = %e, "failed to reclaim token, will retry");
                }
            }
        }
        if reclaimed > 0 {
            metrics::counter!("copilot_pool_reclaimed_total").increment(reclaimed as u64);
        }
        Ok(reclaimed)
    }

    pub fn record_quota(&mut self, id: u64, snapshot: QuotaSnapshot, reset_at: Option<u64>) {
        self.quotas.insert(id, (snapshot, reset_at));
    }

    pub fn cached_quota(&self, id: u64) -> Option<&QuotaSnapshot> {
        self.quotas.get(&id).map(|(snapshot, _)| snapshot)
    }

    pub async fn insert(&mut self, secret: &str) -> Result<u64> {
        let id = self.store.insert(secret).await?;
        if let Err(pos) = self.index.binary_search(&id) {
            self.index.insert(pos, id);
        }
        Ok(id)
    }

    pub async fn remove(&mut self, id: u64) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        self.index.retain(|&i| i != id);
        self.quotas.remove(&id);
        Ok(removed)
    }

    /// Round-robin successor: the first indexed id after `cursor`, wrapping.
    ///
    /// The cursor doesn't have to be indexed any more (it may have been
    /// retired or removed); selection resumes from its position.
    pub fn next_after(&self, cursor: Option<u64>) -> Option<u64> {
        let first = self.index.first().copied();
        let Some(cursor) = cursor else {
            return first;
        };
        self.index
            .iter()
            .copied()
            .find(|&id| id > cursor)
            .or(first)
    }
}
