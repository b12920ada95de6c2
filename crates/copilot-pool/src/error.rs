//! Error types for pool operations

/// Errors from pool and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The active set is empty (after reclaiming whatever could be reclaimed).
    #[error("no token available: {0}")]
    NoTokenAvailable(String),

    /// Selection kept landing on unusable tokens until the attempt ceiling.
    #[error("rotation gave up after {0} attempts")]
    RotationExhausted(u32),

    #[error("token store error: {0}")]
    Store(#[from] copilot_auth::Error),

    /// The exchange endpoint could not be reached at all. Not specific to
    /// one token, so selection doesn't move on.
    #[error("token exchange unreachable: {0}")]
    Exchange(copilot_auth::Error),
}

impl Error {
    /// Whether the caller should treat this as "nothing to serve with".
    pub fn is_no_token(&self) -> bool {
        matches!(self, Error::NoTokenAvailable(_) | Error::RotationExhausted(_))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
