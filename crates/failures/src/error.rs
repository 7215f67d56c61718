use thiserror::Error;

use taskhub_core::TaskHubError;

/// Errors raised while loading rules or opening the failure ledger.
#[derive(Debug, Error)]
pub enum FailureError {
    #[error("failure ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rule parse error: {0}")]
    RuleParse(#[from] serde_yaml::Error),

    #[error("invalid rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    #[error("ledger encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<FailureError> for TaskHubError {
    fn from(e: FailureError) -> Self {
        match e {
            FailureError::Io(io) => TaskHubError::Io(io),
            FailureError::Encode(e) => TaskHubError::Serialization(e.to_string()),
            other => TaskHubError::Config(other.to_string()),
        }
    }
}
