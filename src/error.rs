use crate::backend::BackendError;
use thiserror::Error;

/// Message shown when bulk mark-read is refused by the backend.
pub const PERMISSION_DENIED_MESSAGE: &str =
    "You do not have permission to mark these notifications as read.";

/// Errors surfaced to feed and mutation callers.
#[derive(Debug, Error)]
pub enum FeedError {
    /// No owner is bound, so there is nothing to fetch or mutate
    #[error("No notification owner is set; sign in before updating notifications")]
    MissingOwner,

    /// Backend refused a bulk update with the designated permission code
    #[error("{}", PERMISSION_DENIED_MESSAGE)]
    PermissionDenied,

    /// Any other backend or network failure, passed through unchanged
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl FeedError {
    /// True for failures worth retrying as-is (network and backend errors).
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Backend(_))
    }
}
