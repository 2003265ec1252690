//! Error taxonomy for the outreach pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OutreachError>;

#[derive(Debug, Error)]
pub enum OutreachError {
    /// Network failure, explicit `Failed` outcome or timeout from a collaborator.
    #[error("Collaborator error: {0}")]
    TransientCollaborator(String),

    /// Daily ceiling reached. A deferral signal, not a failure.
    #[error("Daily limit reached for {action} on {date}")]
    QuotaExceeded { action: String, date: String },

    #[error("Storage error: {message}")]
    Storage { message: String, corrupt: bool },

    #[error("Invalid transition for {contact_id}: {event} not allowed from {from}")]
    InvalidTransition {
        contact_id: String,
        from: String,
        event: String,
    },

    #[error("Unfired {kind} item already scheduled for {owner}")]
    DuplicateScheduledItem { owner: String, kind: String },

    /// A row changed underneath an in-flight transition.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    /// Contact state disagrees with its timestamp set.
    #[error("Inconsistent contact: {0}")]
    Inconsistent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OutreachError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            corrupt: false,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            corrupt: true,
        }
    }

    /// Whether a later tick may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientCollaborator(_) | Self::QuotaExceeded { .. } | Self::Conflict(_) => true,
            Self::Storage { corrupt, .. } => !corrupt,
            _ => false,
        }
    }

    /// Errors that take a contact out of automated processing.
    pub fn quarantines(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::Inconsistent(_) | Self::Storage { corrupt: true, .. }
        )
    }
}

impl From<serde_json::Error> for OutreachError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(OutreachError::TransientCollaborator("timeout".into()).is_retryable());
        assert!(OutreachError::storage("disk busy").is_retryable());
        assert!(!OutreachError::corrupt("bad page").is_retryable());
        assert!(
            !OutreachError::InvalidTransition {
                contact_id: "c1".into(),
                from: "discovered".into(),
                event: "reply_detected".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_quarantine_classification() {
        assert!(OutreachError::corrupt("bad page").quarantines());
        assert!(OutreachError::Inconsistent("c1".into()).quarantines());
        assert!(!OutreachError::TransientCollaborator("x".into()).quarantines());
    }
}
