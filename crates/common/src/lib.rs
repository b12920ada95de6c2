//! Shared types for the Copilot token pool workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
