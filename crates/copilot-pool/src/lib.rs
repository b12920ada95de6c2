//! Token pool for Copilot accounts
//!
//! Pools several long-lived tokens behind one `TokenManager`: round-robin
//! selection, access-token caching, quota-based retirement and automatic
//! reactivation once a quota window resets. Storage lives in `copilot-auth`;
//! this crate decides which token to use.
//!
//! Token lifecycle:
//! 1. Admin adds a token → `TokenManager::add_token()` writes it to the active set
//! 2. `get_token()` selects round-robin, exchanges and caches the access token
//! 3. A response reports `chat: 0` → `report_quota()` moves it to the exhausted set
//! 4. Reset time passes → the next rotation (or the reclaim task) moves it back

pub mod error;
pub mod manager;
pub mod pool;
pub mod quota;
pub mod reclaim;

pub use error::{Error, Result};
pub use manager::{AccessToken, ManagerSettings, ManagerStatus, TokenManager, TokenStatus};
pub use pool::TokenPool;
pub use quota::{ErrorClassification, QuotaTracker, classify_status};
pub use reclaim::spawn_reclaim_task;
