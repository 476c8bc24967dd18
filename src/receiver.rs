//! Listening socket and inbound packet decoding.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatcher::{Event, EventQueue};
use crate::errors::Error;
use crate::logger::Logger;
use crate::packet::{self, Header, PacketType, Payload};

type Result<T> = std::result::Result<T, Error>;

const BUFFER_SIZE: usize = 65536;

/// Lifecycle of a [`PacketReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// A datagram whose type has a known inbound layout.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub header: Header,
    pub kind: PacketType,
    pub payload: Payload,
    pub addr: SocketAddr,
}

pub(crate) enum Datagram {
    Known(InboundPacket),
    Unknown { header: Header, raw: Vec<u8> },
}

/// Decodes one datagram. Only inbound packet types are decoded; anything else
/// is returned with its payload bytes untouched.
pub(crate) fn decode(bytes: &[u8], addr: SocketAddr) -> Result<Datagram> {
    let (header, rest) = packet::parse_header(bytes)?;
    match header.kind().filter(|kind| kind.is_inbound()) {
        Some(kind) => {
            let payload = packet::parse_payload(rest, kind.layout())?;
            Ok(Datagram::Known(InboundPacket {
                header,
                kind,
                payload,
                addr,
            }))
        }
        None => Ok(Datagram::Unknown {
            header,
            raw: rest.to_vec(),
        }),
    }
}

/// Stop flag and state shared between the receiver thread and its owner.
#[derive(Clone)]
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<ReceiverState>>,
}

impl ReceiverHandle {
    /// Asks the loop to exit at its next poll.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if *state == ReceiverState::Running {
            *state = ReceiverState::Stopping;
        }
    }

    pub fn state(&self) -> ReceiverState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ReceiverState) {
        *lock(&self.state) = next;
    }
}

fn lock(state: &Mutex<ReceiverState>) -> std::sync::MutexGuard<'_, ReceiverState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the listening socket until [`spawn`](Self::spawn) moves it onto a thread.
pub struct PacketReceiver {
    socket: UdpSocket,
    poll_interval: Duration,
    handle: ReceiverHandle,
}

impl PacketReceiver {
    /// Binds the listening socket. `poll_interval` bounds each receive so the
    /// loop can notice a stop request.
    pub fn bind(addr: SocketAddr, poll_interval: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| Error::socket("bind listener", e))?;
        socket
            .set_read_timeout(Some(poll_interval))
            .map_err(|e| Error::socket("set_read_timeout", e))?;

        Ok(PacketReceiver {
            socket,
            poll_interval,
            handle: ReceiverHandle {
                stop: Arc::new(AtomicBool::new(false)),
                state: Arc::new(Mutex::new(ReceiverState::Idle)),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::socket("local_addr", e))
    }

    pub fn handle(&self) -> ReceiverHandle {
        self.handle.clone()
    }

    /// Starts the receive loop.
    ///
    /// Every decoded packet is queued as [`Event::Packet`] and then passed to
    /// `on_packet`; unrecognized types are queued as [`Event::Unknown`].
    /// Malformed datagrams are logged and dropped. Other socket errors are
    /// logged and followed by a pause of one poll interval.
    pub fn spawn<H>(self, events: EventQueue, logger: Logger, mut on_packet: H) -> JoinHandle<()>
    where
        H: FnMut(&InboundPacket) + Send + 'static,
    {
        let PacketReceiver {
            socket,
            poll_interval,
            handle,
        } = self;
        handle.set_state(ReceiverState::Running);

        thread::spawn(move || {
            let mut buffer = vec![0u8; BUFFER_SIZE];

            while !handle.stop.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buffer) {
                    Ok((size, addr)) => match decode(&buffer[..size], addr) {
                        Ok(Datagram::Known(packet)) => {
                            logger.debug(format!(
                                "received {:?} from {addr}: {}",
                                packet.kind,
                                packet::to_hex(&buffer[..size])
                            ));
                            events.emit(Event::Packet {
                                header: packet.header,
                                payload: packet.payload.clone(),
                                addr,
                            });
                            on_packet(&packet);
                        }
                        Ok(Datagram::Unknown { header, raw }) => {
                            logger.debug(format!(
                                "unknown packet type {:#06x} from {addr}",
                                header.packet_type
                            ));
                            events.emit(Event::Unknown { header, raw, addr });
                        }
                        Err(e) => logger.warn(format!("dropping datagram from {addr}: {e}")),
                    },
                    Err(ref e) if is_poll_timeout(e) => {}
                    Err(e) => {
                        logger.error(format!("receive socket error: {e}"));
                        thread::sleep(poll_interval);
                    }
                }
            }

            handle.set_state(ReceiverState::Stopped);
        })
    }
}

/// A read timeout surfaces as `WouldBlock` or `TimedOut` depending on the platform.
fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, EventKey, HandlerRegistry};
    use crate::logger::LogSink;
    use crate::packet::{FieldValue, SERVICE_UDP};
    use crate::types::Mac;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::mpsc;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn test_decode_known_and_unknown() {
        let addr = loopback();
        let packet = PacketType::PowerState
            .encode(Mac::ALL, Mac::ALL, &[FieldValue::U16(0xffff)], None)
            .unwrap();
        match decode(&packet, addr).unwrap() {
            Datagram::Known(p) => {
                assert_eq!(p.kind, PacketType::PowerState);
                assert_eq!(p.payload.u16("is_on"), Some(0xffff));
            }
            Datagram::Unknown { .. } => panic!("expected a known packet"),
        }

        let mut odd = PacketType::GetGateway
            .encode(Mac::ALL, Mac::ALL, &[], None)
            .unwrap();
        odd[32] = 0x77;
        odd.extend_from_slice(&[1, 2, 3]);
        match decode(&odd, addr).unwrap() {
            Datagram::Unknown { header, raw } => {
                assert_eq!(header.packet_type, 0x77);
                assert_eq!(raw, vec![1, 2, 3]);
            }
            Datagram::Known(_) => panic!("expected an unknown packet"),
        }
    }

    #[test]
    fn test_decode_outbound_type_is_unknown() {
        let packet = PacketType::GetLightState
            .encode(Mac::ALL, Mac::ALL, &[], None)
            .unwrap();
        assert!(matches!(
            decode(&packet, loopback()).unwrap(),
            Datagram::Unknown { .. }
        ));
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let mut packet = PacketType::PowerState
            .encode(Mac::ALL, Mac::ALL, &[FieldValue::U16(1)], None)
            .unwrap();
        packet.pop();
        assert!(decode(&packet, loopback()).is_err());
        assert!(decode(&[0u8; 10], loopback()).is_err());
    }

    #[test]
    fn test_loop_forwards_and_stops() {
        let sink = LogSink::start(false).unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        let (unknown_tx, unknown_rx) = mpsc::channel();
        let unknown_tx = Mutex::new(unknown_tx);
        registry.register(EventKey::Unknown, move |event: &Event| {
            if let Event::Unknown { header, .. } = event {
                let _ = unknown_tx.lock().unwrap().send(header.packet_type);
            }
        });
        let mut dispatcher =
            Dispatcher::start(Arc::clone(&registry), sink.logger()).unwrap();

        let receiver = PacketReceiver::bind(loopback(), Duration::from_millis(20)).unwrap();
        let target = receiver.local_addr().unwrap();
        let handle = receiver.handle();
        assert_eq!(handle.state(), ReceiverState::Idle);

        let (packet_tx, packet_rx) = mpsc::channel();
        let worker = receiver.spawn(dispatcher.queue(), sink.logger(), move |p| {
            let _ = packet_tx.send(p.kind);
        });
        assert_eq!(handle.state(), ReceiverState::Running);

        let client = UdpSocket::bind(loopback()).unwrap();
        client.send_to(b"noise", target).unwrap();
        let advert = PacketType::Gateway
            .encode(
                Mac::ALL,
                Mac::ALL,
                &[FieldValue::U8(SERVICE_UDP), FieldValue::U32(56700)],
                None,
            )
            .unwrap();
        client.send_to(&advert, target).unwrap();
        let mut odd = advert[..packet::HEADER_SIZE].to_vec();
        odd[32] = 0x42;
        client.send_to(&odd, target).unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(packet_rx.recv_timeout(timeout), Ok(PacketType::Gateway));
        assert_eq!(unknown_rx.recv_timeout(timeout), Ok(0x42));

        handle.stop();
        worker.join().unwrap();
        assert_eq!(handle.state(), ReceiverState::Stopped);
        dispatcher.shutdown();
    }

    #[test]
    fn test_poll_timeouts_are_not_errors() {
        assert!(is_poll_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_poll_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_poll_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
