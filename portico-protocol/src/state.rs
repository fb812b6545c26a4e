//! Per-connection protocol state
//!
//! ```text
//! Connecting --hello--> AwaitingRegistration --register ok--> Registered
//!      \                        |                                 |
//!       `-----------------------+------------> Closed <-----------'
//! ```

use std::fmt;

/// Where a control connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Accepted, waiting for `hello`
    #[default]
    Connecting,
    /// `hello` accepted, waiting for the first `register`
    AwaitingRegistration,
    /// A tunnel has been registered
    Registered,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingRegistration => "awaiting_registration",
            ConnectionState::Registered => "registered",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Attempted transition that the state machine forbids
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition from {from} to {to}")]
pub struct StateError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Whether `self -> next` is allowed
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{AwaitingRegistration, Closed, Connecting, Registered};
        matches!(
            (self, next),
            (Connecting, AwaitingRegistration)
                | (AwaitingRegistration, Registered)
                | (Connecting | AwaitingRegistration | Registered, Closed)
        )
    }

    /// Move to `next`, or report why not
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), StateError> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(StateError {
                from: *self,
                to: next,
            })
        }
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}
