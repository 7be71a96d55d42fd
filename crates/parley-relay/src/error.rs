use parley_core::errors::BackendError;
use parley_store::StoreError;

/// What the user sees when a turn fails, regardless of the failure stage.
pub const USER_FACING_ERROR: &str = "An error occurred while processing your message.";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("turn cancelled")]
    Cancelled,
}

impl RelayError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Backend(e) => e.error_kind(),
            Self::Persistence(_) => "persistence_error",
            Self::Cancelled => "cancelled",
        }
    }
}
