// ============================================================================
// Hub Errors
// ============================================================================
//
// Crate-level error type. Backing-store failures surface as `Store` and are
// propagated with `?` on every staging/scheduling path so the caller can pick
// a fallback. Delivery outcomes have their own type (see hub::transport).
//
// ============================================================================

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Backing store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Dispatched messages whose outcome could not be written back to the
    /// queue or the retry schedule
    #[error(
        "Outcome of {} dispatched message(s) not recorded: {}",
        .message_ids.len(),
        .last_error
    )]
    Unrecorded {
        message_ids: Vec<Uuid>,
        last_error: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<redis::RedisError> for HubError {
    fn from(err: redis::RedisError) -> Self {
        HubError::Store(err.to_string())
    }
}

impl HubError {
    /// Store errors are worth retrying; everything else is a caller bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, HubError::Store(_))
    }
}
