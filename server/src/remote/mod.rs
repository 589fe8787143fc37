//! Cloud relay control channel.
//!
//! - [`client`]: the reconnecting WebSocket client and its handshake
//! - [`dns`]: relay hostname cache with validation after successful auth
//! - [`relays`]: server/account routing data pushed by the relay

pub mod client;
pub mod dns;
pub mod relays;

/// Sent in the auth handshake; the relay rejects versions it cannot serve.
pub const PROTOCOL_VERSION: u32 = 6;

/// Why a relay connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// DNS, TCP, TLS, socket errors, closes and liveness timeouts.
    Network(String),
    /// The relay rejected the key. Retrying with the same key is pointless.
    Key,
    /// The relay refused the handshake for another reason (version).
    Protocol(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Network(e) => write!(f, "network error: {e}"),
            RemoteError::Key => write!(f, "remote key rejected"),
            RemoteError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for RemoteError {}
