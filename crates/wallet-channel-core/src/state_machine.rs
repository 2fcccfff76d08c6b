use serde::{Deserialize, Serialize};

use crate::ports::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Connect,
    HandshakeSucceeded,
    Fail,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: &'static str,
}

/// `Error` is left only by an explicit disconnect or a caller-driven reconnect.
pub fn connection_transition(
    from: ConnectionState,
    action: ConnectionAction,
) -> Result<StateTransition, BridgeError> {
    use ConnectionAction as A;
    use ConnectionState as S;

    let (to, reason) = match (from, action) {
        (S::Disconnected | S::Error, A::Connect) => (S::Connecting, "connect requested"),
        (S::Connecting, A::HandshakeSucceeded) => (S::Connected, "handshake completed"),
        (S::Connecting | S::Connected, A::Fail) => (S::Error, "connection failed"),
        (S::Error, A::Fail) => (S::Error, "connection failed again"),
        (S::Connecting | S::Connected | S::Error, A::Disconnect) => {
            (S::Disconnected, "disconnect requested")
        }
        (S::Disconnected, A::Disconnect) => (S::Disconnected, "already disconnected"),
        _ => {
            return Err(BridgeError::Transport(format!(
                "illegal connection transition: {from:?} --{action:?}-->"
            )))
        }
    };
    Ok(StateTransition { from, to, reason })
}
