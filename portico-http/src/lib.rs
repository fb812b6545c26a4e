pub mod admin;
pub mod ingress;
pub mod proxy;
pub mod relay;

pub use admin::{AdminServer, AdminState, Authorizer, BearerTokenAuthorizer};
pub use ingress::HttpIngress;
pub use proxy::{LocalExecutor, LocalForwarder};
pub use relay::{Relay, RelayError};
