//! Session configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::errors::Error;
use crate::packet::{LIFX_PORT, PROTOCOL_COMMAND, PROTOCOL_DISCOVERY};

/// Protocol tags written into the packet header.
///
/// These changed between gateway firmware revisions, so they are configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTags {
    /// Tag for the broadcast gateway discovery request.
    pub discovery: u16,
    /// Tag for every addressed command.
    pub command: u16,
}

impl Default for ProtocolTags {
    fn default() -> Self {
        ProtocolTags {
            discovery: PROTOCOL_DISCOVERY,
            command: PROTOCOL_COMMAND,
        }
    }
}

/// Settings for a [`Lifx`](crate::Lifx) session and the stateless helpers.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use lifx_lights_rs::Config;
///
/// let config = Config::new(2)
///     .with_fade(Duration::from_millis(250))
///     .with_logging(false);
/// assert_eq!(config.num_bulbs, 2);
///
/// let loaded = Config::from_json(r#"{"num_bulbs": 3, "retry_delay": 1000}"#).unwrap();
/// assert_eq!(loaded.num_bulbs, 3);
/// assert_eq!(loaded.retry_delay, Duration::from_secs(1));
/// ```
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How many bulbs the session waits for.
    pub num_bulbs: usize,
    /// Where gateway and bulb responses arrive.
    pub listen_addr: SocketAddr,
    /// Destination of the gateway discovery broadcast.
    pub broadcast_addr: SocketAddr,
    /// Local address for outbound sockets.
    pub local_addr: SocketAddr,
    pub protocol: ProtocolTags,
    /// Receive timeout of the listening socket; only bounds shutdown latency.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Attempts for gateway and bulb discovery when the session connects itself.
    pub attempts: u32,
    /// Wait after each discovery attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    /// Wait for the sender to bind the gateway; attempted once.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_delay: Duration,
    /// Transition time sent with every light state change.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fade: Duration,
    /// Whether the session log sink emits records.
    pub logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_bulbs: 1,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), LIFX_PORT),
            broadcast_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), LIFX_PORT),
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            protocol: ProtocolTags::default(),
            poll_interval: Duration::from_millis(100),
            attempts: 10,
            retry_delay: Duration::from_millis(500),
            connect_delay: Duration::from_secs(2),
            fade: Duration::ZERO,
            logging: true,
        }
    }
}

impl Config {
    pub fn new(num_bulbs: usize) -> Self {
        Config {
            num_bulbs,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::JsonLoad)
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolTags) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_fade(mut self, fade: Duration) -> Self {
        self.fade = fade;
        self
    }

    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    /// Fade time in wire units (milliseconds, saturating).
    pub(crate) fn fade_millis(&self) -> u32 {
        u32::try_from(self.fade.as_millis()).unwrap_or(u32::MAX)
    }
}
