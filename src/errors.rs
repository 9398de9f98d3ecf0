use thiserror::Error;

/// Typed error hierarchy for switchboard.
///
/// Use at module boundaries (storage tiers, platform calls, inference,
/// gateway dispatch). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant allows seamless conversion
/// via the `?` operator.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Tenant {0} not present in any storage tier")]
    TenantNotFound(String),

    #[error("Storage tier '{tier}' error: {message}")]
    Store { tier: &'static str, message: String },

    #[error("Chat platform error: {0}")]
    Platform(String),

    #[error("Inference error: {message}")]
    Inference { message: String, retryable: bool },

    #[error("Event delivery error: {0}")]
    Event(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `SwitchboardError`.
pub type SwitchboardResult<T> = std::result::Result<T, SwitchboardError>;

impl SwitchboardError {
    /// Whether this error is worth retrying (transient inference/storage
    /// failures). Signature and config errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            SwitchboardError::Inference { retryable, .. } => *retryable,
            SwitchboardError::Store { .. } => true,
            _ => false,
        }
    }
}
