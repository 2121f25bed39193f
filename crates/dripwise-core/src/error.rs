//! Dripwise error types.

use thiserror::Error;

/// Every failure the scheduling core can observe.
///
/// Nothing here reaches an end user directly. Batch passes catch these per
/// item and degrade to "retry on the next pass".
#[derive(Debug, Error)]
pub enum DripError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DripError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn billing(msg: impl Into<String>) -> Self {
        Self::Billing(msg.into())
    }

    pub fn action(msg: impl Into<String>) -> Self {
        Self::Action(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DripError>;

/// Cut an error message down to at most `max_chars` characters for storage.
/// Always splits on a char boundary.
pub fn truncate_error(msg: &str, max_chars: usize) -> String {
    match msg.char_indices().nth(max_chars) {
        Some((idx, _)) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}
