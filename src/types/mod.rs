//! Value types shared by the codec, the session and the public API.

mod device;
mod light_state;
mod mac;

pub use device::{Bulb, Gateway};
pub use light_state::{
    LightState, RawLightState, hue_to_raw, raw_to_hue, raw_to_unit, unit_to_raw,
};
pub use mac::Mac;
