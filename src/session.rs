//! Shared session state: the gateway binding, the three per-bulb mappings and
//! their readiness signals.
//!
//! Every mutation happens under one lock, and a readiness signal is only set
//! or cleared while that lock is held, so the "count reached" check can never
//! disagree with the mapping it describes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::Error;
use crate::signal::Signal;
use crate::types::{Bulb, Gateway, LightState, Mac};

type Result<T> = std::result::Result<T, Error>;

/// Which response mapping a blocking command waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Power,
    Light,
}

#[derive(Default)]
struct Mappings {
    gateway: Option<Gateway>,
    bulbs: HashMap<Mac, Bulb>,
    power: HashMap<Mac, bool>,
    light: HashMap<Mac, LightState>,
    power_expected: usize,
    light_expected: usize,
}

pub struct SessionState {
    expected: usize,
    mappings: Mutex<Mappings>,
    gateway_found: Signal,
    bulbs_found: Signal,
    power_ready: Signal,
    light_ready: Signal,
}

impl SessionState {
    /// `expected` is the number of bulbs the session waits for.
    pub fn new(expected: usize) -> Self {
        let state = SessionState {
            expected,
            mappings: Mutex::new(Mappings::default()),
            gateway_found: Signal::new(),
            bulbs_found: Signal::new(),
            power_ready: Signal::new(),
            light_ready: Signal::new(),
        };
        state.reset();
        state
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Forgets everything, including the gateway binding.
    pub fn reset(&self) {
        let mut m = self.lock();
        *m = Mappings {
            power_expected: self.expected,
            light_expected: self.expected,
            ..Mappings::default()
        };
        self.gateway_found.clear();
        self.bulbs_found.clear();
        self.power_ready.clear();
        self.light_ready.clear();
        if self.expected == 0 {
            self.bulbs_found.set();
        }
    }

    pub fn gateway_found(&self) -> &Signal {
        &self.gateway_found
    }

    pub fn bulbs_found(&self) -> &Signal {
        &self.bulbs_found
    }

    pub fn ready(&self, which: Readiness) -> &Signal {
        match which {
            Readiness::Power => &self.power_ready,
            Readiness::Light => &self.light_ready,
        }
    }

    /// Binds the session gateway. Only the first call per session takes effect.
    pub fn bind_gateway(&self, gateway: Gateway) -> bool {
        let mut m = self.lock();
        if m.gateway.is_some() {
            return false;
        }
        m.gateway = Some(gateway);
        self.gateway_found.set();
        true
    }

    pub fn gateway(&self) -> Option<Gateway> {
        self.lock().gateway
    }

    /// Records a power report and returns the reporting bulb.
    pub fn record_power(&self, mac: Mac, is_on: bool) -> Bulb {
        let mut m = self.lock();
        m.power.insert(mac, is_on);
        if m.power.len() >= m.power_expected {
            self.power_ready.set();
        }
        lookup(&m, mac)
    }

    /// Records a light state report, registering the bulb under its label.
    pub fn record_light(&self, mac: Mac, state: LightState) -> Bulb {
        let mut m = self.lock();
        let bulb = Bulb::new(mac, state.label.clone());
        m.bulbs.insert(mac, bulb.clone());
        m.light.insert(mac, state);
        if m.bulbs.len() >= self.expected {
            self.bulbs_found.set();
        }
        if m.light.len() >= m.light_expected {
            self.light_ready.set();
        }
        bulb
    }

    /// Clears one response mapping and its signal, then runs `send` while
    /// still holding the lock so no stale report can satisfy the new wait.
    pub fn begin_command<F>(&self, which: Readiness, expected: usize, send: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut m = self.lock();
        match which {
            Readiness::Power => {
                m.power.clear();
                m.power_expected = expected;
            }
            Readiness::Light => {
                m.light.clear();
                m.light_expected = expected;
            }
        }
        // Nothing to wait for when no replies are expected.
        if expected == 0 {
            self.ready(which).set();
        } else {
            self.ready(which).clear();
        }
        send()
    }

    pub fn bulb(&self, mac: Mac) -> Bulb {
        lookup(&self.lock(), mac)
    }

    pub fn bulbs(&self) -> Vec<Bulb> {
        let mut bulbs: Vec<Bulb> = self.lock().bulbs.values().cloned().collect();
        bulbs.sort_by_key(|b| b.mac);
        bulbs
    }

    pub fn power_states(&self) -> HashMap<Mac, bool> {
        self.lock().power.clone()
    }

    pub fn light_states(&self) -> HashMap<Mac, LightState> {
        self.lock().light.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Mappings> {
        self.mappings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lookup(m: &Mappings, mac: Mac) -> Bulb {
    m.bulbs
        .get(&mac)
        .cloned()
        .unwrap_or_else(|| Bulb::placeholder(mac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn light(label: &str) -> LightState {
        LightState {
            hue: 0.0,
            saturation: 0.0,
            brightness: 1.0,
            kelvin: 3500,
            dim: 0,
            is_on: true,
            label: label.to_string(),
            tags: [0; 8],
        }
    }

    fn mac(n: u8) -> Mac {
        Mac::new([0xd0, 0x73, 0xd5, 0, 0, n])
    }

    #[test]
    fn test_first_gateway_wins() {
        let state = SessionState::new(1);
        let first = Gateway {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            port: 56700,
            mac: mac(1),
        };
        let second = Gateway {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            ..first
        };
        assert!(state.bind_gateway(first));
        assert!(!state.bind_gateway(second));
        assert_eq!(state.gateway(), Some(first));
        assert!(state.gateway_found().is_set());
    }

    #[test]
    fn test_bulbs_found_at_expected_count() {
        let state = SessionState::new(2);
        state.record_light(mac(1), light("Desk"));
        assert!(!state.bulbs_found().is_set());
        state.record_light(mac(1), light("Desk"));
        assert!(!state.bulbs_found().is_set());
        state.record_light(mac(2), light("Hall"));
        assert!(state.bulbs_found().is_set());
        assert!(state.ready(Readiness::Light).is_set());
        assert_eq!(state.bulb(mac(2)).label, "Hall");
    }

    #[test]
    fn test_power_report_uses_known_label() {
        let state = SessionState::new(1);
        assert_eq!(state.record_power(mac(1), true), Bulb::placeholder(mac(1)));
        state.record_light(mac(1), light("Porch"));
        assert_eq!(state.record_power(mac(1), false).label, "Porch");
        assert_eq!(state.power_states().get(&mac(1)), Some(&false));
    }

    #[test]
    fn test_begin_command_resets_mapping() {
        let state = SessionState::new(2);
        state.record_power(mac(1), true);
        state.record_power(mac(2), true);
        assert!(state.ready(Readiness::Power).is_set());

        state
            .begin_command(Readiness::Power, 1, || Ok(()))
            .unwrap();
        assert!(!state.ready(Readiness::Power).is_set());
        assert!(state.power_states().is_empty());

        state.record_power(mac(2), false);
        assert!(state.ready(Readiness::Power).is_set());
    }

    #[test]
    fn test_begin_command_propagates_send_error() {
        let state = SessionState::new(1);
        let err = state
            .begin_command(Readiness::Light, 1, || Err(Error::NotConnected))
            .unwrap_err();
        assert_eq!(err, Error::NotConnected);
    }

    #[test]
    fn test_begin_command_expecting_no_replies() {
        let state = SessionState::new(0);
        state
            .begin_command(Readiness::Power, 0, || Ok(()))
            .unwrap();
        assert!(state.ready(Readiness::Power).is_set());
        assert!(state.power_states().is_empty());

        state
            .begin_command(Readiness::Light, 0, || Ok(()))
            .unwrap();
        assert!(state.ready(Readiness::Light).is_set());
    }

    #[test]
    fn test_zero_expected_bulbs() {
        let state = SessionState::new(0);
        assert!(state.bulbs_found().is_set());
    }
}
