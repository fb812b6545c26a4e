//! Portico control channel protocol
//!
//! This crate defines the length-prefixed JSON protocol spoken between
//! Portico clients and the broker.

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod frame;
pub mod state;
pub mod validation;

pub use codec::{encode_raw, encoded_len, is_encode_error, Decoded, EncodeError, TunnelCodec};
pub use envelope::{decode_envelope, EnvelopeError};
pub use frame::{
    ErrorCode, Frame, HelloStatus, RegisterStatus, RequestFrame, ResponseFrame,
};
pub use state::{ConnectionState, StateError};
pub use validation::{
    normalize_domain, validate_connection_id, validate_frame, ValidationError, ValidationLimits,
};
