//! Copilot token storage and exchange
//!
//! Persists long-lived GitHub tokens one file per token and turns them into
//! the bearer values the Copilot API accepts. This crate knows nothing about
//! rotation or quotas; `copilot-pool` builds on it.
//!
//! Token lifecycle on disk:
//! 1. `TokenStore::insert()` writes `<id>.copilot_token` atomically
//! 2. `TokenStore::exhaust()` renames it into `QuotaExhausted/<reset_at>-<id>.copilot_token`
//! 3. `TokenStore::reactivate()` renames it back once the reset time passes
//! 4. `TokenStore::recover()` repairs leftovers from an interrupted process

pub mod constants;
pub mod error;
pub mod exchange;
pub mod record;
pub mod store;

pub use constants::*;
pub use error::{Error, Result};
pub use exchange::{AccessGrant, CopilotExchange, PassthroughExchange, TokenExchange};
pub use record::{ExhaustedEntry, QuotaSnapshot, TokenRecord, TokenState, unix_now};
pub use store::{Recovery, Scan, TokenStore};
