//! Protocol constants

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Time a freshly accepted connection has to send its `hello`
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Maximum length of an authentication token
pub const MAX_TOKEN_LEN: usize = 256;

/// Maximum length of a client supplied connection id
pub const MAX_CONNECTION_ID_LEN: usize = 128;

/// Maximum length of a custom domain (RFC 1035 presentation form)
pub const MAX_DOMAIN_LEN: usize = 253;
