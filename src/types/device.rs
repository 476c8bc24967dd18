//! Bulbs and gateways.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::Mac;

/// A bulb known to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bulb {
    pub mac: Mac,
    pub label: String,
}

impl Bulb {
    pub fn new(mac: Mac, label: impl Into<String>) -> Self {
        Bulb {
            mac,
            label: label.into(),
        }
    }

    /// Stand-in for a bulb that has not reported its light state yet.
    pub fn placeholder(mac: Mac) -> Self {
        Bulb {
            mac,
            label: format!("<unknown bulb {mac}>"),
        }
    }
}

/// The gateway a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub addr: IpAddr,
    pub port: u16,
    pub mac: Mac,
}

impl Gateway {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}
