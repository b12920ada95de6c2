//! Error types for upstream dispatch

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing in the pool can serve the request. Returned at once, never
    /// retried.
    #[error("no token available: {0}")]
    NoTokenAvailable(String),

    /// Every attempt failed. `last` describes the final failure.
    #[error("upstream unavailable after {attempts} attempts: {last}")]
    UpstreamUnavailable { attempts: u32, last: String },

    /// The selected token reports usage telemetry, so the request was refused
    /// before reaching upstream.
    #[error("token {0} has telemetry enabled")]
    TelemetryEnabled(u64),

    #[error("token pool error: {0}")]
    Pool(copilot_pool::Error),
}

impl From<copilot_pool::Error> for Error {
    fn from(e: copilot_pool::Error) -> Self {
        if e.is_no_token() {
            Error::NoTokenAvailable(e.to_string())
        } else {
            Error::Pool(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
