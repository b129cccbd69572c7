//! Session lifecycle.

use std::fmt;

use crate::errors::ConnectionError;

/// Where a [`Session`](crate::Session) is in its lifecycle.
///
/// `Idle → Connecting → Connected → Closing → Finished`. A session that loses its
/// transport while connected may also go straight from `Connected` to `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Constructed, `open` not called yet.
    #[default]
    Idle,
    /// The opening handshake is in progress or has failed.
    Connecting,
    /// The handshake was validated; frames may flow.
    Connected,
    /// A close frame has been sent; waiting for the peer's.
    Closing,
    /// The close exchange completed or was abandoned. Terminal.
    Finished,
}

impl ConnectionState {
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Closing, Connected, Connecting, Finished, Idle};
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connected, Closing)
                | (Connected, Finished)
                | (Closing, Finished)
        )
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) -> Result<(), ConnectionError> {
        if !self.can_transition_to(next) {
            return Err(ConnectionError::InvalidStateTransition {
                from: *self,
                to: next,
            });
        }
        tracing::debug!(from = %self, to = %next, "session state transition");
        *self = next;
        Ok(())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Finished => "finished",
        };
        f.write_str(name)
    }
}
