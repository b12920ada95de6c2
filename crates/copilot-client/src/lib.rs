//! Retrying dispatcher for the Copilot API
//!
//! `ApiClient` takes a token from `TokenManager`, sends the request, and feeds
//! what the response says about quota back into the manager. Transient
//! failures are retried on the same token with exponential backoff; auth and
//! quota failures move to another token. All of it counts against one attempt
//! ceiling.
//!
//! The serving layer only sees the `RequestHandler` trait, so it can be wired
//! to a stub in tests.

pub mod client;
pub mod error;
pub mod event;

pub use client::{ApiClient, ClientSettings};
pub use error::{Error, Result};
pub use event::{AttemptEvent, AttemptObserver, AttemptOutcome, NoopObserver};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::pin::Pin;

/// Request to forward upstream. `path` includes the query string.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Token that served the final attempt.
    pub token_id: u64,
    pub attempts: u32,
}

/// Capability the HTTP serving layer depends on.
///
/// Uses `Pin<Box<dyn Future>>` so it stays usable as `Arc<dyn RequestHandler>`.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + '_>>;
}
