//! Error types for token storage and exchange

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    /// A single token file could not be parsed or read. Scans log and skip
    /// these; they are never fatal to the whole pool.
    #[error("corrupt token entry: {0}")]
    StoreCorrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

pub type Result<T> = std::result::Result<T, Error>;
