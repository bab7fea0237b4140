use crate::types::{is_hex_of_len, SignedEvent};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

/// Lowercased 64-hex public key or event id, or `None` when the input is not one.
pub fn normalize_hex_key(value: &str) -> Option<String> {
    let trimmed = value.trim().to_lowercase();
    if is_hex_of_len(&trimmed, 64) {
        Some(trimmed)
    } else {
        None
    }
}

pub fn normalize_relay_url(url: &str) -> String {
    let compact: String = url.chars().filter(|c| !c.is_whitespace()).collect();
    compact.trim_end_matches('/').to_lowercase()
}

pub fn validate_content(content: &str, max_bytes: usize) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty("content"));
    }
    if content.len() > max_bytes {
        return Err(ValidationError::TooLong("content"));
    }
    Ok(())
}

pub fn validate_signed_event(event: &SignedEvent) -> Result<(), ValidationError> {
    if !is_hex_of_len(&event.id, 64) {
        return Err(ValidationError::Invalid("id"));
    }
    if !is_hex_of_len(&event.pubkey, 64) {
        return Err(ValidationError::Invalid("pubkey"));
    }
    if !is_hex_of_len(&event.sig, 128) {
        return Err(ValidationError::Invalid("sig"));
    }
    Ok(())
}
