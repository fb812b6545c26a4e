//! Token helpers shared by the control channel and the admin API

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time comparison of two byte slices
///
/// Length mismatch returns early; contents are compared without short-circuit.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Hash a token using SHA-256
#[must_use]
pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Verify a token against a stored hash using constant-time comparison
#[must_use]
pub fn verify_token_hash(token: &str, expected_hash: &[u8; 32]) -> bool {
    let token_hash = hash_token(token);
    constant_time_eq(&token_hash, expected_hash)
}

/// Validate token format
pub fn validate_token_format(token: &str, max_len: usize) -> Result<(), TokenValidationError> {
    if token.is_empty() {
        return Err(TokenValidationError::Empty);
    }
    if token.len() > max_len {
        return Err(TokenValidationError::TooLong {
            len: token.len(),
            max: max_len,
        });
    }
    if !token.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(TokenValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Token validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenValidationError {
    #[error("token is empty")]
    Empty,
    #[error("token too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("token contains invalid characters")]
    InvalidCharacters,
}

/// Check an optional presented token against the configured one.
///
/// No configured token means the channel is open.
pub fn token_matches(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(expected), Some(presented)) => {
            constant_time_eq(expected.as_bytes(), presented.as_bytes())
        }
    }
}
