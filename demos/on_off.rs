//! Turns every bulb on, waits a second and turns them off again.
//!
//! Run with: RUST_LOG=debug cargo run --example on_off

use lifx_lights_rs::{Config, Lifx, Mac};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), lifx_lights_rs::Error> {
    env_logger::init();

    // So it knows how many bulbs to wait for when connecting.
    let lifx = Lifx::new(Config::new(2));
    lifx.on_connected(|_| println!("Connected!"));

    lifx.run_session(|lifx| -> Result<(), lifx_lights_rs::Error> {
        lifx.set_power_state(true, Mac::ALL, Duration::from_secs(1))?;
        thread::sleep(Duration::from_secs(1));
        lifx.set_power_state(false, Mac::ALL, Duration::from_secs(1))?;
        Ok(())
    })?
}
