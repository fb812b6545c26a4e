//! Default ports and addresses for Portico services.
//!
//! Use these constants instead of magic numbers so defaults stay consistent
//! across the library, CLI, and tests.

/// Default port for the control channel (client–broker protocol).
pub const DEFAULT_CONTROL_PORT: u16 = 7835;

/// Default port for the administrative API.
pub const DEFAULT_ADMIN_PORT: u16 = 7836;

/// Default port for the public relay entry point.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default bind address for the control channel (`0.0.0.0:7835`).
pub const DEFAULT_CONTROL_BIND: &str = "0.0.0.0:7835";

/// Default bind address for the administrative API (`127.0.0.1:7836`).
pub const DEFAULT_ADMIN_BIND: &str = "127.0.0.1:7836";

/// Default bind address for the public relay (`0.0.0.0:8080`).
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

/// Default host the client agent forwards requests to.
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

/// Default host the broker dials for tunnels created through the admin API.
pub const DEFAULT_STATIC_UPSTREAM_HOST: &str = "127.0.0.1";
