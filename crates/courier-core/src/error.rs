use thiserror::Error;

/// Ack messages matching any of these are never retried.
pub const NON_RETRYABLE_PATTERNS: [&str; 8] = [
    "malformed",
    "invalid",
    "unauthorized",
    "forbidden",
    "denied",
    "duplicate",
    "policy",
    "signature",
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("signer unavailable")]
    SignerUnavailable,
    #[error("encryption {0}")]
    Encryption(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("relay {relay} rejected: {reason}")]
    RelayRejection {
        relay: String,
        reason: String,
        retryable: bool,
    },
    #[error("quorum not reached ({accepted}/{required})")]
    QuorumNotReached { accepted: u32, required: u32 },
    #[error("timeout {0}")]
    Timeout(String),
    #[error("storage")]
    Storage,
    #[error("codec {0}")]
    Codec(String),
    #[error("validation {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
}

impl CoreError {
    pub fn rejection(relay: &str, reason: &str) -> Self {
        CoreError::RelayRejection {
            relay: relay.to_string(),
            reason: reason.to_string(),
            retryable: !is_non_retryable(reason),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::SignerUnavailable => false,
            CoreError::Encryption(reason) => !is_non_retryable(reason),
            CoreError::Transport(_) => true,
            CoreError::RelayRejection { retryable, .. } => *retryable,
            CoreError::QuorumNotReached { .. } => true,
            CoreError::Timeout(_) => true,
            CoreError::Storage => true,
            CoreError::Codec(_) | CoreError::Validation(_) | CoreError::NotFound => false,
        }
    }
}

pub fn is_non_retryable(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    NON_RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Codec(err.to_string())
    }
}
