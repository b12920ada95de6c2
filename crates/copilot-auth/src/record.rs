//! Token records and quota snapshots
//!
//! A record's `state` always matches the directory its file lives in. The
//! cached quota snapshot is in-memory only; the store never writes it.

use std::collections::BTreeMap;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Which storage set a token file currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Active,
    Exhausted,
}

/// Remaining allowance per usage category (e.g. `"chat" => 42`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaSnapshot(BTreeMap<String, i64>);

impl QuotaSnapshot {
    pub fn get(&self, category: &str) -> Option<i64> {
        self.0.get(category).copied()
    }
}

impl<K: Into<String>> FromIterator<(K, i64)> for QuotaSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// An active token loaded from disk.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: u64,
    pub secret: Secret<String>,
    pub state: TokenState,
    /// Unix seconds at which the last reported quota window resets.
    pub quota_reset_at: Option<u64>,
    pub cached_quota: Option<QuotaSnapshot>,
}

impl TokenRecord {
    pub fn active(id: u64, secret: Secret<String>) -> Self {
        Self {
            id,
            secret,
            state: TokenState::Active,
            quota_reset_at: None,
            cached_quota: None,
        }
    }
}

/// An exhausted token as seen from its filename alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExhaustedEntry {
    pub id: u64,
    /// Unix seconds after which the token may be reactivated.
    pub reset_at: u64,
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
