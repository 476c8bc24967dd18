//! Light state reports and the unit conversions between float and raw values.

use serde::{Deserialize, Serialize};

use crate::packet::Payload;

const RAW_MAX: f64 = 0xffff as f64;

/// Scales a hue in degrees to the 16-bit wire range.
///
/// The hue is wrapped into `[0, 360)` first, so `360.0` and `0.0` are both red.
///
/// ```
/// use lifx_lights_rs::hue_to_raw;
///
/// assert_eq!(hue_to_raw(0.0), 0);
/// assert_eq!(hue_to_raw(360.0), 0);
/// assert_eq!(hue_to_raw(180.0), 0x7fff);
/// ```
pub fn hue_to_raw(hue: f64) -> u16 {
    let wrapped = hue.rem_euclid(360.0);
    ((wrapped / 360.0 * RAW_MAX).floor() as i64 & 0xffff) as u16
}

/// Scales a saturation or brightness in `[0, 1]` to the 16-bit wire range.
pub fn unit_to_raw(value: f64) -> u16 {
    ((value * RAW_MAX).floor() as i64 & 0xffff) as u16
}

pub fn raw_to_hue(raw: u16) -> f64 {
    raw as f64 / RAW_MAX * 360.0
}

pub fn raw_to_unit(raw: u16) -> f64 {
    raw as f64 / RAW_MAX
}

/// Takes the bytes up to the first NUL and trims surrounding whitespace.
pub(crate) fn decode_label(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// A light state report exactly as the bulb sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLightState {
    pub hue: u16,
    pub saturation: u16,
    pub brightness: u16,
    pub kelvin: u16,
    pub dim: u16,
    pub power: u16,
    pub label: String,
    pub tags: [u8; 8],
}

impl RawLightState {
    /// Reads the fields of a decoded light-state payload.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        let tags_bytes = payload.bytes("tags")?;
        let mut tags = [0u8; 8];
        if tags_bytes.len() != tags.len() {
            return None;
        }
        tags.copy_from_slice(tags_bytes);

        Some(RawLightState {
            hue: payload.u16("hue")?,
            saturation: payload.u16("saturation")?,
            brightness: payload.u16("brightness")?,
            kelvin: payload.u16("kelvin")?,
            dim: payload.u16("dim")?,
            power: payload.u16("power")?,
            label: decode_label(payload.bytes("label")?),
            tags,
        })
    }
}

/// Last known state of a bulb in human units.
///
/// Hue is in degrees `[0, 360)`, saturation and brightness in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    pub hue: f64,
    pub saturation: f64,
    pub brightness: f64,
    pub kelvin: u16,
    pub dim: u16,
    pub is_on: bool,
    pub label: String,
    pub tags: [u8; 8],
}

impl From<&RawLightState> for LightState {
    fn from(raw: &RawLightState) -> Self {
        LightState {
            hue: raw_to_hue(raw.hue),
            saturation: raw_to_unit(raw.saturation),
            brightness: raw_to_unit(raw.brightness),
            kelvin: raw.kelvin,
            dim: raw.dim,
            is_on: raw.power != 0,
            label: raw.label.clone(),
            tags: raw.tags,
        }
    }
}
