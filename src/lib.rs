//! # lifx_lights_rs
//!
//! A Rust client for LIFX bulbs on the local network, speaking the first-generation
//! gateway-based binary UDP protocol.
//!
//! The main entry point is [`Lifx`], a session that discovers a gateway, binds
//! to it, waits for the expected number of bulbs and then offers blocking
//! commands. Incoming reports are delivered to registered callbacks on a
//! dedicated dispatcher thread.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use lifx_lights_rs::{Config, Lifx, Mac};
//!
//! fn main() -> Result<(), lifx_lights_rs::Error> {
//!     let lifx = Lifx::new(Config::new(2));
//!     lifx.on_light_state(|bulb, state| {
//!         println!("{}: hue {:.0}, on: {}", bulb.label, state.hue, state.is_on);
//!     });
//!
//!     lifx.run_session(|lifx| -> Result<(), lifx_lights_rs::Error> {
//!         lifx.set_power_state(true, Mac::ALL, Duration::from_secs(1))?;
//!         lifx.set_light_state(0.0, 1.0, 1.0, 0, Mac::ALL, Duration::from_secs(1))?;
//!         Ok(())
//!     })?
//! }
//! ```
//!
//! ## Features
//!
//! - **Session engine**: three-phase handshake with bounded retries, see [`Lifx::connect`]
//! - **Blocking commands**: [`Lifx::set_power_state`] and [`Lifx::set_light_state`]
//!   return the states the bulbs reported back
//! - **Callbacks**: per-event handlers with [`Lifx::on`] and the `on_*` helpers
//! - **Packet codec**: [`build_packet`], [`parse_header`] and [`parse_payload`]
//! - **Stateless helpers**: async [`find_bulbs`], [`get_state`], [`set_power`],
//!   [`set_state`] and [`refresh`] for scripts that need no session
//! - **Configuration**: [`Config`] with builder methods or JSON
//!
//! ## Communication
//!
//! Gateways are discovered by broadcast on UDP port 56700 and answer on the
//! same port, so only one listener per host can run at a time.
//!
//! ## Runtime Selection
//!
//! The session engine runs on plain threads. The stateless helpers are async
//! and runtime-agnostic; select the runtime with a feature flag:
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime

mod config;
mod discovery;
mod dispatcher;
mod engine;
mod errors;
mod logger;
pub mod packet;
mod receiver;
mod retry;
pub mod runtime;
mod sender;
mod session;
mod signal;
mod types;

pub use config::{Config, ProtocolTags};
pub use discovery::{
    BulbState, DiscoveredBulb, find_bulbs, get_state, refresh, set_power, set_state, set_state_raw,
};
pub use dispatcher::{Event, EventKey};
pub use engine::Lifx;
pub use errors::{Error, HandshakePhase};
pub use logger::{LogSink, Logger};
pub use packet::{Header, PacketType, Payload, build_packet, parse_header, parse_payload};
pub use receiver::ReceiverState;
pub use retry::retry;
pub use signal::Signal;
pub use types::{
    Bulb, Gateway, LightState, Mac, RawLightState, hue_to_raw, raw_to_hue, raw_to_unit,
    unit_to_raw,
};
