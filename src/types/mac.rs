//! Hardware addresses of bulbs and gateways.

use std::fmt;
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::errors::Error;

/// A 6-byte hardware address identifying a bulb or a gateway.
///
/// The all-zero address ([`Mac::ALL`]) addresses every bulb behind a gateway.
///
/// # Examples
///
/// ```
/// use lifx_lights_rs::Mac;
///
/// let mac: Mac = "d0:73:d5:01:02:03".parse().unwrap();
/// assert_eq!(mac.bytes(), [0xd0, 0x73, 0xd5, 0x01, 0x02, 0x03]);
/// assert_eq!(mac.to_string(), "d0:73:d5:01:02:03");
/// assert!(Mac::ALL.is_all());
/// ```
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct Mac([u8; 6]);

impl Mac {
    /// The broadcast target: every bulb on the gateway.
    pub const ALL: Mac = Mac([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Mac(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

impl From<[u8; 6]> for Mac {
    fn from(bytes: [u8; 6]) -> Self {
        Mac(bytes)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Parses `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`.
impl FromStr for Mac {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidMac(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidMac(s.to_string()))?;
        }
        Ok(Mac(bytes))
    }
}
