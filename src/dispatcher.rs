//! Callback dispatch on a single consumer thread.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::errors::Error;
use crate::logger::Logger;
use crate::packet::{Header, PacketType, Payload};
use crate::types::{Bulb, Gateway, LightState};

type Result<T> = std::result::Result<T, Error>;

/// Something observers can subscribe to.
#[derive(Debug, Clone)]
pub enum Event {
    /// A gateway answered discovery.
    Discovered(Gateway),
    /// The sender is bound to the gateway.
    Connected(Gateway),
    /// The expected number of bulbs reported in.
    BulbsFound(Vec<Bulb>),
    PowerState { bulb: Bulb, is_on: bool },
    LightState { bulb: Bulb, state: LightState },
    /// A datagram with a type code that has no known layout.
    Unknown {
        header: Header,
        raw: Vec<u8>,
        addr: SocketAddr,
    },
    /// Any decoded datagram, keyed by its type code.
    Packet {
        header: Header,
        payload: Payload,
        addr: SocketAddr,
    },
}

impl Event {
    pub fn key(&self) -> EventKey {
        match self {
            Event::Discovered(_) => EventKey::Discovered,
            Event::Connected(_) => EventKey::Connected,
            Event::BulbsFound(_) => EventKey::BulbsFound,
            Event::PowerState { .. } => EventKey::PowerState,
            Event::LightState { .. } => EventKey::LightState,
            Event::Unknown { .. } => EventKey::Unknown,
            Event::Packet { header, .. } => EventKey::Packet(header.packet_type),
        }
    }
}

/// Registration key: a lifecycle event or a raw packet type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Discovered,
    Connected,
    BulbsFound,
    PowerState,
    LightState,
    Unknown,
    Packet(u16),
}

impl From<PacketType> for EventKey {
    fn from(kind: PacketType) -> Self {
        EventKey::Packet(kind.code())
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Ordered handler lists per event key, safe to touch from any thread.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<EventKey, Vec<Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, key: EventKey, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.lock().entry(key).or_default().push(Arc::new(handler));
    }

    /// Snapshot of the handlers for `key`, in registration order.
    pub fn handlers(&self, key: EventKey) -> Vec<Handler> {
        self.lock().get(&key).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKey, Vec<Handler>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Job {
    Event(Event),
    Shutdown,
}

/// Cheap handle for queueing events onto a [`Dispatcher`].
#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<Job>,
}

impl EventQueue {
    /// Queues `event`; returns `false` once the dispatcher has shut down.
    pub fn emit(&self, event: Event) -> bool {
        self.tx.send(Job::Event(event)).is_ok()
    }
}

/// Owns the dispatch worker thread.
pub struct Dispatcher {
    queue: EventQueue,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(registry: Arc<HandlerRegistry>, logger: Logger) -> Result<Self> {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("lifx-dispatcher".into())
            .spawn(move || dispatch(rx, registry, logger))
            .map_err(|e| Error::socket("spawn dispatcher", e))?;

        Ok(Dispatcher {
            queue: EventQueue { tx },
            worker: Some(worker),
        })
    }

    pub fn queue(&self) -> EventQueue {
        self.queue.clone()
    }

    /// Queues the shutdown sentinel after all pending events and joins the worker.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.queue.tx.send(Job::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(rx: Receiver<Job>, registry: Arc<HandlerRegistry>, logger: Logger) {
    while let Ok(job) = rx.recv() {
        let event = match job {
            Job::Event(event) => event,
            Job::Shutdown => break,
        };

        let key = event.key();
        for handler in registry.handlers(key) {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                logger.error(format!(
                    "handler for {key:?} panicked: {}",
                    panic_message(&*panic)
                ));
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogSink;
    use crate::types::Mac;
    use std::net::{IpAddr, Ipv4Addr};

    fn gateway(n: u8) -> Gateway {
        Gateway {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 56700,
            mac: Mac::new([n; 6]),
        }
    }

    fn recorder(
        registry: &HandlerRegistry,
        key: EventKey,
        tag: &'static str,
    ) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        registry.register(
            key,
            move |event: &Event| {
                if let Event::Discovered(gw) = event {
                    out.lock().unwrap().push(format!("{tag}:{}", gw.mac));
                }
            },
        );
        seen
    }

    #[test]
    fn test_fifo_across_producers() {
        let sink = LogSink::start(false).unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        registry.register(
            EventKey::Discovered,
            move |event: &Event| {
                if let Event::Discovered(gw) = event {
                    out.lock().unwrap().push(gw.mac.bytes()[0]);
                }
            },
        );

        let mut dispatcher =
            Dispatcher::start(Arc::clone(&registry), sink.logger()).unwrap();
        // Serialize the producers so the enqueue order is known.
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4u8)
            .map(|p| {
                let queue = dispatcher.queue();
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    for i in 0..25u8 {
                        let n = p * 25 + i;
                        let mut order = order.lock().unwrap();
                        order.push(n);
                        queue.emit(Event::Discovered(gateway(n)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        dispatcher.shutdown();

        assert_eq!(*seen.lock().unwrap(), *order.lock().unwrap());
        assert_eq!(seen.lock().unwrap().len(), 100);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let sink = LogSink::start(false).unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let out = Arc::clone(&log);
            registry.register(EventKey::Discovered, move |_: &Event| {
                out.lock().unwrap().push(tag)
            });
        }

        let mut dispatcher =
            Dispatcher::start(Arc::clone(&registry), sink.logger()).unwrap();
        dispatcher.queue().emit(Event::Discovered(gateway(1)));
        dispatcher.queue().emit(Event::Discovered(gateway(2)));
        dispatcher.shutdown();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "third", "first", "second", "third"]
        );
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let sink = LogSink::start(false).unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(EventKey::Discovered, |_: &Event| panic!("observer failure"));
        let seen = recorder(&registry, EventKey::Discovered, "ok");

        let mut dispatcher =
            Dispatcher::start(Arc::clone(&registry), sink.logger()).unwrap();
        dispatcher.queue().emit(Event::Discovered(gateway(1)));
        dispatcher.queue().emit(Event::Discovered(gateway(2)));
        dispatcher.shutdown();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ok:01:01:01:01:01:01", "ok:02:02:02:02:02:02"]
        );
    }

    #[test]
    fn test_registration_during_dispatch() {
        let sink = LogSink::start(false).unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        let late = Arc::new(Mutex::new(0));
        let late_out = Arc::clone(&late);
        registry.register(EventKey::Connected, move |_: &Event| {
            let out = Arc::clone(&late_out);
            inner.register(EventKey::Discovered, move |_: &Event| {
                *out.lock().unwrap() += 1
            });
        });

        let mut dispatcher =
            Dispatcher::start(Arc::clone(&registry), sink.logger()).unwrap();
        let queue = dispatcher.queue();
        queue.emit(Event::Connected(gateway(1)));
        queue.emit(Event::Discovered(gateway(1)));
        dispatcher.shutdown();

        assert_eq!(*late.lock().unwrap(), 1);
        assert_eq!(registry.handlers(EventKey::Discovered).len(), 1);
    }

    #[test]
    fn test_packet_key() {
        assert_eq!(
            EventKey::from(PacketType::LightState),
            EventKey::Packet(0x6b)
        );
    }

    #[test]
    fn test_emit_after_shutdown() {
        let sink = LogSink::start(false).unwrap();
        let mut dispatcher =
            Dispatcher::start(Arc::new(HandlerRegistry::new()), sink.logger()).unwrap();
        assert!(dispatcher.worker.is_some());
        let queue = dispatcher.queue();
        dispatcher.shutdown();
        assert!(!queue.emit(Event::Discovered(gateway(1))));
    }
}
