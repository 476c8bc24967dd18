//! The session engine: handshake, blocking commands and callback registration.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Value, json};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Event, EventKey, EventQueue, HandlerRegistry};
use crate::errors::Error;
use crate::logger::{LogSink, Logger};
use crate::packet::{FieldValue, Header, PacketType, Payload, SERVICE_UDP};
use crate::receiver::{InboundPacket, PacketReceiver, ReceiverHandle};
use crate::retry::retry;
use crate::sender::{Outbox, PacketSender};
use crate::session::{Readiness, SessionState};
use crate::signal::Signal;
use crate::types::{Bulb, Gateway, LightState, Mac, RawLightState, hue_to_raw, unit_to_raw};

type Result<T> = std::result::Result<T, Error>;

/// Worker threads and the handles that feed them, alive between start and shutdown.
struct Workers {
    receiver: ReceiverHandle,
    receiver_thread: Option<JoinHandle<()>>,
    listen_addr: SocketAddr,
    dispatcher: Dispatcher,
    sender: PacketSender,
    log_sink: LogSink,
    handles: Handles,
}

#[derive(Clone)]
struct Handles {
    events: EventQueue,
    outbox: Outbox,
    logger: Logger,
    broadcast: Arc<UdpSocket>,
}

/// A session with one LIFX gateway and the bulbs behind it.
///
/// A session runs four worker threads (receiver, sender, dispatcher, logger)
/// between [`start`](Self::start) and [`shutdown`](Self::shutdown). Commands
/// block the calling thread until the bulbs answer or the timeout elapses.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use lifx_lights_rs::{Config, Lifx, Mac};
///
/// let lifx = Lifx::new(Config::new(2));
/// lifx.on_connected(|gateway| println!("connected to {}", gateway.mac));
///
/// lifx.run_session(|lifx| {
///     lifx.set_power_state(true, Mac::ALL, Duration::from_secs(1))?;
///     lifx.set_light_state(240.0, 1.0, 0.5, 3500, Mac::ALL, Duration::from_secs(1))?;
///     Ok::<_, lifx_lights_rs::Error>(())
/// })??;
/// ```
pub struct Lifx {
    config: Config,
    state: Arc<SessionState>,
    handlers: Arc<HandlerRegistry>,
    workers: Mutex<Option<Workers>>,
    stop_requested: Signal,
}

impl Lifx {
    pub fn new(config: Config) -> Self {
        Lifx {
            state: Arc::new(SessionState::new(config.num_bulbs)),
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            workers: Mutex::new(None),
            stop_requested: Signal::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.lock_workers().is_some()
    }

    /// Address the receiver is listening on, while running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.lock_workers().as_ref().map(|w| w.listen_addr)
    }

    /// Starts the worker threads with empty session state.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.lock_workers();
        if workers.is_some() {
            return Err(Error::AlreadyRunning);
        }

        self.state.reset();
        self.stop_requested.clear();

        let log_sink = LogSink::start(self.config.logging)?;
        let logger = log_sink.logger();
        let dispatcher = Dispatcher::start(Arc::clone(&self.handlers), logger.clone())?;
        let sender = PacketSender::start(self.config.local_addr, logger.clone())?;

        let broadcast = UdpSocket::bind(self.config.local_addr)
            .map_err(|e| Error::socket("bind broadcast", e))?;
        broadcast
            .set_broadcast(true)
            .map_err(|e| Error::socket("set_broadcast", e))?;

        let receiver = PacketReceiver::bind(self.config.listen_addr, self.config.poll_interval)?;
        let listen_addr = receiver.local_addr()?;
        let receiver_handle = receiver.handle();

        let events = dispatcher.queue();
        let state = Arc::clone(&self.state);
        let ingest_events = events.clone();
        let ingest_logger = logger.clone();
        let receiver_thread = receiver.spawn(events.clone(), logger.clone(), move |packet| {
            ingest(packet, &state, &ingest_events, &ingest_logger)
        });

        logger.info(format!("session started, listening on {listen_addr}"));
        *workers = Some(Workers {
            receiver: receiver_handle,
            receiver_thread: Some(receiver_thread),
            listen_addr,
            handles: Handles {
                events,
                outbox: sender.outbox(),
                logger,
                broadcast: Arc::new(broadcast),
            },
            dispatcher,
            sender,
            log_sink,
        });
        Ok(())
    }

    /// Runs the three-phase handshake: gateway discovery, gateway binding and
    /// bulb discovery. Blocks for at most about `attempts * delay` per phase.
    pub fn connect(&self, attempts: u32, delay: Duration) -> Result<()> {
        let h = self.handles()?;
        let tags = self.config.protocol;

        let discover = PacketType::GetGateway.encode(
            Mac::ALL,
            Mac::ALL,
            &[],
            Some(tags.discovery),
        )?;
        let found = retry(self.state.gateway_found(), attempts, delay, |n| {
            h.logger.debug(format!("gateway discovery attempt {n}"));
            if let Err(e) = h.broadcast.send_to(&discover, self.config.broadcast_addr) {
                h.logger.warn(format!("discovery broadcast failed: {e}"));
            }
        });
        let gateway = match self.state.gateway() {
            Some(gateway) if found => gateway,
            _ => return Err(Error::DiscoveryTimeout { attempts }),
        };
        h.events.emit(Event::Discovered(gateway));

        let connected = retry(h.outbox.connected(), 1, self.config.connect_delay, |_| {
            if let Err(e) = h.outbox.bind(gateway) {
                h.logger.error(format!("could not queue gateway binding: {e}"));
            }
        });
        if !connected {
            return Err(Error::ConnectTimeout { attempts: 1 });
        }
        h.events.emit(Event::Connected(gateway));

        let query = PacketType::GetLightState.encode(
            gateway.mac,
            Mac::ALL,
            &[],
            Some(tags.command),
        )?;
        let complete = retry(self.state.bulbs_found(), attempts, delay, |n| {
            h.logger.debug(format!("bulb discovery attempt {n}"));
            if let Err(e) = h.outbox.send(query.clone()) {
                h.logger.error(format!("could not queue light state request: {e}"));
            }
        });
        let bulbs = self.state.bulbs();
        if !complete {
            return Err(Error::BulbCount {
                found: bulbs.len(),
                expected: self.state.expected(),
            });
        }
        h.logger.info(format!("found {} bulbs", bulbs.len()));
        h.events.emit(Event::BulbsFound(bulbs));
        Ok(())
    }

    /// Starts the session, connects, runs `f` and shuts down again, on every
    /// exit path including a failed handshake or a panic inside `f`.
    pub fn run_session<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Lifx) -> T,
    {
        self.start()?;
        let _guard = ShutdownGuard(self);
        self.connect(self.config.attempts, self.config.retry_delay)?;
        Ok(f(self))
    }

    /// Starts and connects, then blocks until [`stop`](Self::stop) is called.
    pub fn run_forever(&self) -> Result<()> {
        self.run_session(|lifx| lifx.stop_requested.wait())
    }

    /// Asks the receiver to stop and releases [`run_forever`](Self::run_forever).
    ///
    /// Safe to call from a callback; full teardown happens in [`shutdown`](Self::shutdown).
    pub fn stop(&self) {
        if let Some(workers) = self.lock_workers().as_ref() {
            workers.receiver.stop();
        }
        self.stop_requested.set();
    }

    /// Stops and joins every worker thread.
    ///
    /// The receiver goes first since it is the only producer left; the
    /// dispatcher, sender and logger then see their sentinel as the last item.
    /// Must not be called from a callback.
    pub fn shutdown(&self) {
        let Some(mut workers) = self.lock_workers().take() else {
            return;
        };
        workers.handles.logger.info("session shutting down");
        workers.receiver.stop();
        if let Some(thread) = workers.receiver_thread.take() {
            let _ = thread.join();
        }
        workers.dispatcher.shutdown();
        workers.sender.shutdown();
        workers.log_sink.shutdown();
    }

    /// Turns bulbs on or off and returns the power states reported back.
    ///
    /// Waits up to `timeout` for every targeted bulb; if some stay silent the
    /// result only holds the ones that answered.
    pub fn set_power_state(
        &self,
        is_on: bool,
        target: Mac,
        timeout: Duration,
    ) -> Result<HashMap<Mac, bool>> {
        let level = if is_on { 0xffff } else { 0 };
        self.command(
            Readiness::Power,
            PacketType::SetPowerState,
            &[FieldValue::U16(level)],
            target,
            timeout,
        )?;
        Ok(self.state.power_states())
    }

    /// Sets the color of bulbs in human units and returns the states reported back.
    ///
    /// `hue` is in degrees and wraps around 360; `saturation` and `brightness`
    /// are in `[0, 1]`. A non-zero `kelvin` selects the white spectrum.
    pub fn set_light_state(
        &self,
        hue: f64,
        saturation: f64,
        brightness: f64,
        kelvin: u16,
        target: Mac,
        timeout: Duration,
    ) -> Result<HashMap<Mac, LightState>> {
        self.set_light_state_raw(
            hue_to_raw(hue),
            unit_to_raw(saturation),
            unit_to_raw(brightness),
            kelvin,
            target,
            timeout,
        )
    }

    /// Like [`set_light_state`](Self::set_light_state) with pre-scaled 16-bit values.
    pub fn set_light_state_raw(
        &self,
        hue: u16,
        saturation: u16,
        brightness: u16,
        kelvin: u16,
        target: Mac,
        timeout: Duration,
    ) -> Result<HashMap<Mac, LightState>> {
        let values = [
            FieldValue::U16(hue),
            FieldValue::U16(saturation),
            FieldValue::U16(brightness),
            FieldValue::U16(kelvin),
            FieldValue::U32(self.config.fade_millis()),
        ];
        self.command(
            Readiness::Light,
            PacketType::SetLightState,
            &values,
            target,
            timeout,
        )?;
        Ok(self.state.light_states())
    }

    fn command(
        &self,
        which: Readiness,
        kind: PacketType,
        values: &[FieldValue],
        target: Mac,
        timeout: Duration,
    ) -> Result<()> {
        let h = self.handles()?;
        let gateway = self.state.gateway().ok_or(Error::NotConnected)?;
        let tags = self.config.protocol;
        let command = kind.encode(gateway.mac, target, values, Some(tags.command))?;
        let refresh =
            PacketType::GetLightState.encode(gateway.mac, target, &[], Some(tags.command))?;

        let expected = if target.is_all() {
            self.state.expected()
        } else {
            1
        };
        self.state.begin_command(which, expected, || {
            h.outbox.send(command)?;
            h.outbox.send(refresh)
        })?;

        if !self.state.ready(which).wait_timeout(timeout) {
            h.logger.debug(format!(
                "{kind:?} to {target}: timed out waiting for {expected} replies"
            ));
        }
        Ok(())
    }

    /// The bulb with this address, or a placeholder if it never reported.
    pub fn get_bulb(&self, mac: Mac) -> Bulb {
        self.state.bulb(mac)
    }

    pub fn bulbs(&self) -> Vec<Bulb> {
        self.state.bulbs()
    }

    pub fn gateway(&self) -> Option<Gateway> {
        self.state.gateway()
    }

    pub fn power_states(&self) -> HashMap<Mac, bool> {
        self.state.power_states()
    }

    pub fn light_states(&self) -> HashMap<Mac, LightState> {
        self.state.light_states()
    }

    /// Registers `handler` for `key`. Handlers run on the dispatcher thread in
    /// registration order; a panicking handler is logged and skipped.
    pub fn on<F>(&self, key: EventKey, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers.register(key, handler);
    }

    pub fn on_discovered<F>(&self, handler: F)
    where
        F: Fn(&Gateway) + Send + Sync + 'static,
    {
        self.on(EventKey::Discovered, move |event| {
            if let Event::Discovered(gateway) = event {
                handler(gateway)
            }
        });
    }

    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn(&Gateway) + Send + Sync + 'static,
    {
        self.on(EventKey::Connected, move |event| {
            if let Event::Connected(gateway) = event {
                handler(gateway)
            }
        });
    }

    pub fn on_bulbs_found<F>(&self, handler: F)
    where
        F: Fn(&[Bulb]) + Send + Sync + 'static,
    {
        self.on(EventKey::BulbsFound, move |event| {
            if let Event::BulbsFound(bulbs) = event {
                handler(bulbs)
            }
        });
    }

    pub fn on_power_state<F>(&self, handler: F)
    where
        F: Fn(&Bulb, bool) + Send + Sync + 'static,
    {
        self.on(EventKey::PowerState, move |event| {
            if let Event::PowerState { bulb, is_on } = event {
                handler(bulb, *is_on)
            }
        });
    }

    pub fn on_light_state<F>(&self, handler: F)
    where
        F: Fn(&Bulb, &LightState) + Send + Sync + 'static,
    {
        self.on(EventKey::LightState, move |event| {
            if let Event::LightState { bulb, state } = event {
                handler(bulb, state)
            }
        });
    }

    pub fn on_unknown<F>(&self, handler: F)
    where
        F: Fn(&Header, &[u8], SocketAddr) + Send + Sync + 'static,
    {
        self.on(EventKey::Unknown, move |event| {
            if let Event::Unknown { header, raw, addr } = event {
                handler(header, raw, *addr)
            }
        });
    }

    /// Registers for every decoded packet of one type code.
    pub fn on_packet<F>(&self, packet_type: impl Into<u16>, handler: F)
    where
        F: Fn(&Header, &Payload, SocketAddr) + Send + Sync + 'static,
    {
        self.on(EventKey::Packet(packet_type.into()), move |event| {
            if let Event::Packet {
                header,
                payload,
                addr,
            } = event
            {
                handler(header, payload, *addr)
            }
        });
    }

    /// Snapshot of the session for debugging.
    pub fn diagnostics(&self) -> Value {
        let workers = self.lock_workers();
        let receiver = workers.as_ref().map(|w| format!("{:?}", w.receiver.state()));
        let listen_addr = workers.as_ref().map(|w| w.listen_addr.to_string());
        drop(workers);

        json!({
            "running": receiver.is_some(),
            "receiver": receiver,
            "listen_addr": listen_addr,
            "expected_bulbs": self.state.expected(),
            "gateway": self.gateway(),
            "bulbs": self.bulbs(),
            "power": self.power_states(),
            "light": self.light_states(),
        })
    }

    fn handles(&self) -> Result<Handles> {
        self.lock_workers()
            .as_ref()
            .map(|w| w.handles.clone())
            .ok_or(Error::NotRunning)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Option<Workers>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Lifx {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ShutdownGuard<'a>(&'a Lifx);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Applies one inbound packet to the session state and emits the derived event.
///
/// Runs on the receiver thread.
fn ingest(packet: &InboundPacket, state: &SessionState, events: &EventQueue, logger: &Logger) {
    let mac = packet.header.target;
    match packet.kind {
        PacketType::Gateway => {
            let service = packet.payload.u8("service");
            let port = packet
                .payload
                .u32("port")
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0);
            match (service, port) {
                (Some(SERVICE_UDP), Some(port)) => {
                    let gateway = Gateway {
                        addr: packet.addr.ip(),
                        port,
                        mac: packet.header.gateway,
                    };
                    if state.bind_gateway(gateway) {
                        logger.info(format!(
                            "discovered gateway {} at {}",
                            gateway.mac,
                            gateway.socket_addr()
                        ));
                    }
                }
                _ => logger.debug(format!(
                    "ignoring gateway advertisement from {}: service {service:?}, port {port:?}",
                    packet.addr
                )),
            }
        }
        PacketType::PowerState => {
            let Some(level) = packet.payload.u16("is_on") else {
                return;
            };
            let is_on = level != 0;
            let bulb = state.record_power(mac, is_on);
            events.emit(Event::PowerState { bulb, is_on });
        }
        PacketType::LightState => {
            let Some(raw) = RawLightState::from_payload(&packet.payload) else {
                logger.warn(format!("malformed light state from {}", packet.addr));
                return;
            };
            let light = LightState::from(&raw);
            let bulb = state.record_light(mac, light.clone());
            events.emit(Event::LightState { bulb, state: light });
        }
        _ => {}
    }
}
