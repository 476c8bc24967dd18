use std::fmt;

/// The handshake phase that ran out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No gateway answered the broadcast discovery request.
    Discovery,
    /// The sender never acknowledged the gateway binding.
    Connect,
    /// Fewer bulbs than expected reported their light state.
    BulbCount,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakePhase::Discovery => write!(f, "discovery"),
            HandshakePhase::Connect => write!(f, "connect"),
            HandshakePhase::BulbCount => write!(f, "bulb discovery"),
        }
    }
}

/// All error types that can occur when talking to a LIFX gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Packet bytes were shorter than the header or did not match a payload layout.
    #[error("failed to decode packet: expected {expected} bytes, got {actual}")]
    Decode { expected: usize, actual: usize },

    /// Payload values did not match the layout they were encoded against.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// No payload layout is known for this packet type code.
    #[error("unknown packet type {0:#06x}")]
    UnknownPacketType(u16),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: std::io::Error },

    /// No gateway answered the discovery broadcast.
    #[error("no gateway discovered after {attempts} attempts")]
    DiscoveryTimeout { attempts: u32 },

    /// The sender did not bind to the discovered gateway in time.
    #[error("could not connect to gateway after {attempts} attempts")]
    ConnectTimeout { attempts: u32 },

    /// Bulb discovery finished with fewer bulbs than expected.
    #[error("found {found} of {expected} expected bulbs")]
    BulbCount { found: usize, expected: usize },

    /// A raw packet was sent before any gateway binding.
    #[error("not connected to a gateway")]
    NotConnected,

    /// The engine worker threads are not running.
    #[error("session is not running")]
    NotRunning,

    /// The engine worker threads are already running.
    #[error("session is already running")]
    AlreadyRunning,

    /// A hardware address string could not be parsed.
    #[error("invalid hardware address: {0}")]
    InvalidMac(String),

    /// Failed to deserialize JSON data.
    #[error("failed to load json: {0:?}")]
    JsonLoad(serde_json::Error),
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new decode error
    pub fn decode(expected: usize, actual: usize) -> Self {
        Error::Decode { expected, actual }
    }

    /// The handshake phase this error came from, if any.
    pub fn handshake_phase(&self) -> Option<HandshakePhase> {
        match self {
            Error::DiscoveryTimeout { .. } => Some(HandshakePhase::Discovery),
            Error::ConnectTimeout { .. } => Some(HandshakePhase::Connect),
            Error::BulbCount { .. } => Some(HandshakePhase::BulbCount),
            _ => None,
        }
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
