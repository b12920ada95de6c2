//! Token selection, caching and retirement
//!
//! `TokenManager` is the one place that knows which token is currently in
//! use. Pool, round-robin cursor, selection and cached access token all sit
//! behind a single `tokio::sync::Mutex`. Helpers suffixed `_locked` take the
//! guarded state directly so nothing re-acquires the lock.
//!
//! Disk scans happen under the lock. Token exchanges (possibly network calls)
//! never do: `get_token()` picks a record, releases the lock, exchanges, then
//! re-locks to cache the result if the selection hasn't moved in between.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use copilot_auth::{
    AccessGrant, QuotaSnapshot, TokenExchange, TokenRecord, TokenState, TokenStore, unix_now,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::TokenPool;
use crate::quota::QuotaTracker;

/// Tunables for selection and caching.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Lifetime assumed when the exchange doesn't announce one.
    pub token_lifetime: Duration,
    /// Subtracted from the lifetime before caching.
    pub safety_margin: Duration,
    pub max_rotation_attempts: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            token_lifetime: Duration::from_secs(30 * 60),
            safety_margin: Duration::from_secs(10 * 60),
            max_rotation_attempts: 100,
        }
    }
}

/// Bearer value ready to send upstream.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub id: u64,
    pub value: Secret<String>,
    pub expires_at: Instant,
    /// Upstream base announced by the exchange, if any.
    pub api_base: Option<String>,
    /// Whether the account reports usage telemetry.
    pub telemetry_enabled: bool,
}

impl AccessToken {
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Per-token view for status listings. Never carries the secret.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub id: u64,
    pub state: TokenState,
    /// Masked tail of the secret, for active tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Reactivation time when exhausted, else the reported quota reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub active: usize,
    pub exhausted: usize,
    pub current: Option<u64>,
    pub cached: bool,
    pub rotations: u64,
}

struct Selection {
    record: TokenRecord,
    /// `None` until the record has been exchanged.
    token: Option<AccessToken>,
}

struct ManagerState {
    pool: TokenPool,
    /// Last selected id. Survives the selection being cleared so rotation
    /// resumes after it.
    cursor: Option<u64>,
    current: Option<Selection>,
}

pub struct TokenManager {
    state: Mutex<ManagerState>,
    tracker: QuotaTracker,
    exchange: Arc<dyn TokenExchange>,
    settings: ManagerSettings,
    rotations: AtomicU64,
}

impl TokenManager {
    pub fn new(
        store: Arc<TokenStore>,
        tracker: QuotaTracker,
        exchange: Arc<dyn TokenExchange>,
        settings: ManagerSettings,
    ) -> Self {
        info!(
            exchange = exchange.id(),
            max_rotation_attempts = settings.max_rotation_attempts,
            "token manager initialized"
        );
        Self {
            state: Mutex::new(ManagerState {
                pool: TokenPool::new(store),
                cursor: None,
                current: None,
            }),
            tracker,
            exchange,
            settings,
            rotations: AtomicU64::new(0),
        }
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Return a usable access token.
    ///
    /// Serves the cached token while it is valid, unless `force_refresh`.
    /// Otherwise takes the selection made by an explicit `rotate()` if one
    /// is pending, or rotates. A token whose exchange reports an exhausted
    /// quota is retired on the spot and selection continues.
    pub async fn get_token(&self, force_refresh: bool) -> Result<AccessToken> {
        let max_attempts = self.settings.max_rotation_attempts;
        let mut force = force_refresh;

        for _ in 0..max_attempts {
            let record = {
                let mut state = self.state.lock().await;
                if !force
                    && let Some(token) = state.current.as_ref().and_then(|s| s.token.as_ref())
                    && token.is_valid()
                {
                    return Ok(token.clone());
                }
                force = false;

                let pending = state
                    .current
                    .as_ref()
                    .filter(|s| s.token.is_none())
                    .map(|s| s.record.clone());
                match pending {
                    Some(record) => record,
                    None => self.rotate_locked(&mut state, max_attempts).await?,
                }
            };

            let grant = match self.exchange.exchange(&record.secret).await {
                Ok(grant) => grant,
                Err(e @ copilot_auth::Error::Http(_)) => {
                    warn!(token_id = record.id, error = %e, "token exchange unreachable");
                    return Err(Error::Exchange(e));
                }
                Err(e) => {
                    warn!(token_id = record.id, error = %e, "token exchange failed, rotating");
                    self.clear_selection(record.id).await;
                    continue;
                }
            };

            if let Some(payload) = &grant.payload
                && let Some(snapshot) = self.tracker.snapshot_of(payload)
            {
                let reset_at = self.tracker.reset_time_of(payload);
                if self.report_quota(record.id, snapshot, Some(reset_at)).await? {
                    continue;
                }
            }

            let token = self.access_token(record.id, grant);
            let mut state = self.state.lock().await;
            match state.current.as_mut() {
                Some(selection) if selection.record.id == record.id => {
                    selection.token = Some(token.clone());
                }
                _ => debug!(token_id = record.id, "selection moved during exchange, not caching"),
            }
            return Ok(token);
        }

        Err(Error::RotationExhausted(max_attempts))
    }

    /// Select the next active token, round-robin.
    ///
    /// Each pass reclaims expired exhausted tokens first. A selection whose
    /// cached quota is already spent is retired and the pass repeats, at most
    /// `max_attempts` times.
    pub async fn rotate(&self, max_attempts: u32) -> Result<TokenRecord> {
        let mut state = self.state.lock().await;
        self.rotate_locked(&mut state, max_attempts).await
    }

    /// Move away from `failed_id` after it was refused upstream.
    ///
    /// Advances only while `failed_id` is still the selection. If another
    /// caller already moved on, that selection is returned unchanged. With no
    /// selection, rotation resumes after `failed_id`.
    pub async fn rotate_from(&self, failed_id: u64, max_attempts: u32) -> Result<TokenRecord> {
        let mut state = self.state.lock().await;
        match state.current.as_ref() {
            Some(selection) if selection.record.id != failed_id => {
                debug!(
                    token_id = selection.record.id,
                    failed_id, "selection already moved on"
                );
                return Ok(selection.record.clone());
            }
            Some(_) => {}
            None => state.cursor = Some(failed_id),
        }
        self.rotate_locked(&mut state, max_attempts).await
    }

    async fn rotate_locked(
        &self,
        state: &mut ManagerState,
        max_attempts: u32,
    ) -> Result<TokenRecord> {
        for _ in 0..max_attempts {
            state.pool.reclaim_expired(unix_now()).await?;
            let active = state.pool.list_active().await?;

            let Some(id) = state.pool.next_after(state.cursor) else {
                state.current = None;
                return Err(Error::NoTokenAvailable("no active tokens".into()));
            };
            let Some(record) = active.into_iter().find(|r| r.id == id) else {
                state.current = None;
                return Err(Error::NoTokenAvailable(format!("token {id} vanished")));
            };
            state.cursor = Some(id);

            if let Some(quota) = &record.cached_quota
                && self.tracker.is_exhausted(quota)
            {
                debug!(token_id = id, "cached quota exhausted, retiring");
                let reset_at = record
                    .quota_reset_at
                    .unwrap_or_else(|| self.tracker.fallback_reset());
                state.pool.mark_exhausted(id, reset_at).await?;
                continue;
            }

            state.current = Some(Selection {
                record: record.clone(),
                token: None,
            });
            self.rotations.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("copilot_pool_rotations_total").increment(1);
            debug!(token_id = id, "selected token");
            return Ok(record);
        }

        Err(Error::RotationExhausted(max_attempts))
    }

    /// Record an observed quota for a token.
    ///
    /// An exhausted snapshot retires the token until `reset_at` (default:
    /// now plus the tracker's window) and drops it from the current
    /// selection. Returns whether the token was retired.
    pub async fn report_quota(
        &self,
        id: u64,
        snapshot: QuotaSnapshot,
        reset_at: Option<u64>,
    ) -> Result<bool> {
        let exhausted = self.tracker.is_exhausted(&snapshot);
        let mut state = self.state.lock().await;

        if let Some(selection) = state.current.as_mut()
            && selection.record.id == id
        {
            selection.record.cached_quota = Some(snapshot.clone());
            selection.record.quota_reset_at = reset_at;
        }
        state.pool.record_quota(id, snapshot, reset_at);

        if !exhausted {
            return Ok(false);
        }

        let reset_at = reset_at.unwrap_or_else(|| self.tracker.fallback_reset());
        match state.pool.mark_exhausted(id, reset_at).await {
            Ok(()) => {}
            Err(Error::Store(copilot_auth::Error::NotFound(_))) => {
                debug!(token_id = id, "exhausted token no longer stored");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        if state.current.as_ref().is_some_and(|s| s.record.id == id) {
            state.current = None;
        }
        info!(token_id = id, reset_at, "token quota exhausted, retired");
        Ok(true)
    }

    pub async fn add_token(&self, secret: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let id = state.pool.insert(secret).await?;
        info!(token_id = id, "token added");
        Ok(id)
    }

    pub async fn remove_token(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.pool.remove(id).await?;
        if state.current.as_ref().is_some_and(|s| s.record.id == id) {
            state.current = None;
        }
        if removed {
            info!(token_id = id, "token removed");
        }
        Ok(removed)
    }

    pub async fn reclaim_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.pool.reclaim_expired(unix_now()).await
    }

    /// Every stored token, active and exhausted, ordered by id.
    pub async fn list_status(&self) -> Result<Vec<TokenStatus>> {
        let mut state = self.state.lock().await;
        let current = state.current.as_ref().map(|s| s.record.id);
        let active = state.pool.list_active().await?;
        let exhausted = state.pool.list_exhausted().await?;

        let mut statuses: Vec<TokenStatus> = active
            .into_iter()
            .map(|r| TokenStatus {
                id: r.id,
                state: TokenState::Active,
                hint: Some(r.secret.hint()),
                reset_at: r.quota_reset_at,
                quota: r.cached_quota,
                current: current == Some(r.id),
            })
            .chain(exhausted.into_iter().map(|e| TokenStatus {
                id: e.id,
                state: TokenState::Exhausted,
                hint: None,
                reset_at: Some(e.reset_at),
                quota: state.pool.cached_quota(e.id).cloned(),
                current: false,
            }))
            .collect();
        statuses.sort_by_key(|s| s.id);
        Ok(statuses)
    }

    pub async fn status(&self) -> Result<ManagerStatus> {
        let mut state = self.state.lock().await;
        let active = state.pool.list_active().await?.len();
        let exhausted = state.pool.list_exhausted().await?.len();
        let current = state.current.as_ref();
        Ok(ManagerStatus {
            active,
            exhausted,
            current: current.map(|s| s.record.id),
            cached: current
                .and_then(|s| s.token.as_ref())
                .is_some_and(AccessToken::is_valid),
            rotations: self.rotation_count(),
        })
    }

    pub async fn current_token_id(&self) -> Option<u64> {
        self.state.lock().await.current.as_ref().map(|s| s.record.id)
    }

    pub async fn available_count(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        Ok(state.pool.list_active().await?.len())
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Pool health summary for the health endpoint.
    ///
    /// All tokens active → healthy, some active → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let statuses = match self.list_status().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "health check could not read token store");
                return serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                });
            }
        };

        let total = statuses.len();
        let active = statuses
            .iter()
            .filter(|s| s.state == TokenState::Active)
            .count();
        let status = if active == total && total > 0 {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "tokens_total": total,
            "tokens_active": active,
            "tokens_exhausted": total - active,
            "current_token": statuses.iter().find(|s| s.current).map(|s| s.id),
            "rotations": self.rotation_count(),
            "tokens": statuses,
        })
    }

    async fn clear_selection(&self, id: u64) {
        let mut state = self.state.lock().await;
        if state.current.as_ref().is_some_and(|s| s.record.id == id) {
            state.current = None;
        }
    }

    fn access_token(&self, id: u64, grant: AccessGrant) -> AccessToken {
        let lifetime = match grant.expires_at {
            Some(at) => Duration::from_secs(at.saturating_sub(unix_now())),
            None => self.settings.token_lifetime,
        };
        AccessToken {
            id,
            value: grant.token,
            expires_at: Instant::now() + lifetime.saturating_sub(self.settings.safety_margin),
            api_base: grant.api_base,
            telemetry_enabled: grant.telemetry_enabled,
        }
    }
}
