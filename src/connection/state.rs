//! Connection lifecycle state machine

use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, nothing sent yet
    Initial,

    /// SSLRequest probe and TLS handshake
    NegotiatingTls,

    /// Startup and authentication
    Authenticating,

    /// Ready for an operation
    Idle,

    /// An operation owns the connection
    Executing,

    /// Socket closed; the connection cannot be reused
    Closed,
}

impl ConnectionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Initial, NegotiatingTls)
                | (Initial, Authenticating)
                | (NegotiatingTls, Authenticating)
                | (Authenticating, Idle)
                | (Idle, Executing)
                | (Executing, Idle)
                | (_, Closed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {self}"),
                actual: next.to_string(),
            });
        }
        tracing::trace!(from = %self, to = %next, "connection state");
        *self = next;
        Ok(())
    }

    /// Whether an operation may run in this state
    pub fn is_runnable(&self) -> bool {
        !matches!(self, ConnectionState::Executing | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::NegotiatingTls => "negotiating_tls",
            Self::Authenticating => "authenticating",
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Closed => "closed",
        })
    }
}
