//! Outbound packet queue bound to a single gateway.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::errors::Error;
use crate::logger::Logger;
use crate::packet;
use crate::signal::Signal;
use crate::types::Gateway;

type Result<T> = std::result::Result<T, Error>;

enum Outbound {
    Bind(Gateway),
    Packet(Vec<u8>),
    Shutdown,
}

/// Cheap handle for queueing work onto a [`PacketSender`].
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<Outbound>,
    bind_queued: Arc<AtomicBool>,
    connected: Arc<Signal>,
}

impl Outbox {
    /// Queues the gateway binding. Packets queued afterwards go to this gateway.
    pub fn bind(&self, gateway: Gateway) -> Result<()> {
        self.bind_queued.store(true, Ordering::SeqCst);
        self.tx
            .send(Outbound::Bind(gateway))
            .map_err(|_| Error::NotRunning)
    }

    /// Queues a raw packet for the bound gateway.
    ///
    /// Fails with [`Error::NotConnected`] if no binding was queued before it.
    pub fn send(&self, packet: Vec<u8>) -> Result<()> {
        if !self.bind_queued.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.tx
            .send(Outbound::Packet(packet))
            .map_err(|_| Error::NotRunning)
    }

    /// Set once the worker has applied the gateway binding.
    pub fn connected(&self) -> &Signal {
        &self.connected
    }
}

/// Owns the sending socket and its worker thread.
pub struct PacketSender {
    outbox: Outbox,
    worker: Option<JoinHandle<()>>,
}

impl PacketSender {
    /// Binds `local` and starts the worker.
    pub fn start(local: SocketAddr, logger: Logger) -> Result<Self> {
        let socket = UdpSocket::bind(local).map_err(|e| Error::socket("bind sender", e))?;
        let (tx, rx) = unbounded();
        let connected = Arc::new(Signal::new());
        let signal = Arc::clone(&connected);
        let worker = thread::Builder::new()
            .name("lifx-sender".into())
            .spawn(move || run(socket, rx, signal, logger))
            .map_err(|e| Error::socket("spawn sender", e))?;

        Ok(PacketSender {
            outbox: Outbox {
                tx,
                bind_queued: Arc::new(AtomicBool::new(false)),
                connected,
            },
            worker: Some(worker),
        })
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Queues the shutdown sentinel behind pending sends and joins the worker.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.outbox.tx.send(Outbound::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for PacketSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(socket: UdpSocket, rx: Receiver<Outbound>, connected: Arc<Signal>, logger: Logger) {
    let mut gateway: Option<Gateway> = None;

    while let Ok(item) = rx.recv() {
        match item {
            Outbound::Bind(next) => match gateway {
                None => {
                    logger.info(format!(
                        "bound to gateway {} at {}",
                        next.mac,
                        next.socket_addr()
                    ));
                    gateway = Some(next);
                    connected.set();
                }
                Some(current) if current == next => {}
                Some(current) => logger.warn(format!(
                    "ignoring rebind to {}; already bound to {}",
                    next.socket_addr(),
                    current.socket_addr()
                )),
            },
            Outbound::Packet(bytes) => {
                let Some(gw) = gateway else {
                    logger.error("dropping packet queued before gateway binding");
                    continue;
                };
                match socket.send_to(&bytes, gw.socket_addr()) {
                    Ok(_) => logger.debug(format!(
                        "sent to {}: {}",
                        gw.socket_addr(),
                        packet::to_hex(&bytes)
                    )),
                    Err(e) => logger.error(format!("send to {} failed: {e}", gw.socket_addr())),
                }
            }
            Outbound::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogSink;
    use crate::types::Mac;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn test_send_before_bind_fails() {
        let sink = LogSink::start(false).unwrap();
        let mut sender = PacketSender::start(loopback(), sink.logger()).unwrap();
        let outbox = sender.outbox();
        assert_eq!(outbox.send(vec![1, 2, 3]), Err(Error::NotConnected));
        sender.shutdown();
    }

    #[test]
    fn test_bind_then_send_in_order() {
        let sink = LogSink::start(false).unwrap();
        let gateway_socket = UdpSocket::bind(loopback()).unwrap();
        gateway_socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let addr = gateway_socket.local_addr().unwrap();
        let gateway = Gateway {
            addr: addr.ip(),
            port: addr.port(),
            mac: Mac::new([9; 6]),
        };

        let mut sender = PacketSender::start(loopback(), sink.logger()).unwrap();
        let outbox = sender.outbox();
        outbox.bind(gateway).unwrap();
        for i in 0..5u8 {
            outbox.send(vec![i]).unwrap();
        }
        // Shutdown drains everything queued before it.
        sender.shutdown();
        assert!(outbox.connected().is_set());

        let mut buf = [0u8; 16];
        for i in 0..5u8 {
            let (n, _) = gateway_socket.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[i]);
        }
    }

    #[test]
    fn test_send_after_shutdown() {
        let sink = LogSink::start(false).unwrap();
        let mut sender = PacketSender::start(loopback(), sink.logger()).unwrap();
        let outbox = sender.outbox();
        sender.shutdown();
        assert_eq!(
            outbox.bind(Gateway {
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 1,
                mac: Mac::ALL,
            }),
            Err(Error::NotRunning)
        );
    }
}
