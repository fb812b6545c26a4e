//! Frame validation for security hardening

use crate::constants::{MAX_CONNECTION_ID_LEN, MAX_DOMAIN_LEN, MAX_FRAME_SIZE, MAX_TOKEN_LEN};
use crate::frame::Frame;

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Token too long: {len} bytes exceeds limit of {limit} bytes")]
    TokenTooLong { len: usize, limit: usize },

    #[error("Connection id must be 1-{limit} characters of [A-Za-z0-9_-]")]
    InvalidConnectionId { limit: usize },

    #[error("Domain too long: {len} bytes exceeds limit of {limit} bytes")]
    DomainTooLong { len: usize, limit: usize },

    #[error("Too many headers: {count} exceeds limit of {limit}")]
    TooManyHeaders { count: usize, limit: usize },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Validation limits
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_token_len: usize,
    pub max_connection_id_len: usize,
    pub max_domain_len: usize,
    pub max_headers: usize,
    pub max_payload_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_token_len: MAX_TOKEN_LEN,
            max_connection_id_len: MAX_CONNECTION_ID_LEN,
            max_domain_len: MAX_DOMAIN_LEN,
            max_headers: 100,
            max_payload_bytes: MAX_FRAME_SIZE as usize,
        }
    }
}

/// Validate a decoded frame against limits
pub fn validate_frame(frame: &Frame, limits: &ValidationLimits) -> Result<(), ValidationError> {
    match frame {
        Frame::Hello {
            connection_id,
            token,
            ..
        } => {
            if let Some(token) = token {
                if token.len() > limits.max_token_len {
                    return Err(ValidationError::TokenTooLong {
                        len: token.len(),
                        limit: limits.max_token_len,
                    });
                }
            }
            validate_connection_id(connection_id, limits.max_connection_id_len)?;
        }
        Frame::Register {
            custom_domain: Some(domain),
            ..
        } => {
            if domain.len() > limits.max_domain_len {
                return Err(ValidationError::DomainTooLong {
                    len: domain.len(),
                    limit: limits.max_domain_len,
                });
            }
        }
        Frame::Request(request) => {
            check_headers(request.headers.len(), limits)?;
            check_payload(request.body.len(), limits)?;
        }
        Frame::Response(response) => {
            check_headers(response.headers.len(), limits)?;
            check_payload(response.body.len(), limits)?;
        }
        _ => {}
    }
    Ok(())
}

fn check_headers(count: usize, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if count > limits.max_headers {
        return Err(ValidationError::TooManyHeaders {
            count,
            limit: limits.max_headers,
        });
    }
    Ok(())
}

fn check_payload(size: usize, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if size > limits.max_payload_bytes {
        return Err(ValidationError::PayloadTooLarge {
            size,
            limit: limits.max_payload_bytes,
        });
    }
    Ok(())
}

/// Check a client supplied connection id: 1..=`limit` chars of `[A-Za-z0-9_-]`
pub fn validate_connection_id(id: &str, limit: usize) -> Result<(), ValidationError> {
    let well_formed = !id.is_empty()
        && id.len() <= limit
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::InvalidConnectionId { limit })
    }
}

/// Canonical form of a custom domain or Host value used for claims and lookups.
///
/// Trims whitespace, lower-cases and drops a trailing dot. Returns `None`
/// when nothing is left, which callers treat as "no domain".
pub fn normalize_domain(domain: &str) -> Option<String> {
    let trimmed = domain.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}
