//! Stateless LAN helpers: one-shot discovery, state queries and
//! fire-and-forget commands, without a [`Lifx`](crate::Lifx) session.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::Error;
use crate::packet::{FieldValue, PacketType, SERVICE_UDP};
use crate::receiver::{Datagram, InboundPacket, decode};
use crate::runtime::{self, AsyncUdpSocket, Instant, UdpSocket};
use crate::types::{LightState, Mac, RawLightState, hue_to_raw, unit_to_raw};

type Result<T> = std::result::Result<T, Error>;

const BUFFER_SIZE: usize = 4096;

/// A bulb found by [`find_bulbs`], addressed through its gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveredBulb {
    /// Gateway the bulb is reached through.
    pub gateway: Mac,
    pub mac: Mac,
    /// Where commands for this bulb are sent.
    pub addr: SocketAddr,
}

/// A light state report from one discovered bulb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulbState {
    pub bulb: DiscoveredBulb,
    pub state: LightState,
}

/// Broadcasts gateway discovery and collects the advertisements.
///
/// The request is re-broadcast every `send_every`. Returns after `timeout`, or
/// as soon as `expected` distinct bulbs answered.
///
/// # Examples
///
/// ```ignore
/// use std::time::Duration;
/// use lifx_lights_rs::{Config, find_bulbs};
///
/// let config = Config::default();
/// let delay = Duration::from_millis(500);
/// let bulbs = find_bulbs(&config, Some(2), delay, Duration::from_secs(2)).await?;
/// for bulb in bulbs {
///     println!("{} via {} at {}", bulb.mac, bulb.gateway, bulb.addr);
/// }
/// ```
pub async fn find_bulbs(
    config: &Config,
    expected: Option<usize>,
    send_every: Duration,
    timeout: Duration,
) -> Result<Vec<DiscoveredBulb>> {
    let listener = bind(config.listen_addr, "bind listener").await?;
    let sender = bind(config.local_addr, "bind broadcast").await?;
    sender
        .set_broadcast(true)
        .map_err(|e| Error::socket("set_broadcast", e))?;

    let request = PacketType::GetGateway.encode(
        Mac::ALL,
        Mac::ALL,
        &[],
        Some(config.protocol.discovery),
    )?;
    let mut found = BTreeSet::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let start = Instant::now();
    send_to(&sender, &request, config.broadcast_addr).await?;
    let mut last_sent = Instant::now();

    while let Some(remaining) = timeout.checked_sub(start.elapsed()) {
        if expected.is_some_and(|n| found.len() >= n) {
            break;
        }
        if last_sent.elapsed() >= send_every {
            send_to(&sender, &request, config.broadcast_addr).await?;
            last_sent = Instant::now();
        }
        let wait = remaining.min(send_every.saturating_sub(last_sent.elapsed()));

        let Some(packet) = recv(&listener, &mut buffer, wait).await else {
            continue;
        };
        if packet.kind != PacketType::Gateway {
            continue;
        }
        let Some(bulb) = advertised_bulb(&packet) else {
            continue;
        };
        if found.insert(bulb) {
            debug!(
                "discovered bulb {} via gateway {} at {}",
                bulb.mac, bulb.gateway, bulb.addr
            );
        }
    }

    Ok(found.into_iter().collect())
}

/// Asks every bulb for its light state and collects the reports.
///
/// Returns after `timeout`, or once every bulb answered. Bulbs that stayed
/// silent are missing from the result; the rest keep the order of `bulbs`.
pub async fn get_state(
    config: &Config,
    bulbs: &[DiscoveredBulb],
    timeout: Duration,
) -> Result<Vec<BulbState>> {
    if bulbs.is_empty() {
        return Ok(Vec::new());
    }

    // Listen before asking so no early report is lost.
    let listener = bind(config.listen_addr, "bind listener").await?;
    send(config, bulbs, PacketType::GetLightState, &[]).await?;

    let mut states: HashMap<Mac, LightState> = HashMap::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let start = Instant::now();

    while let Some(remaining) = timeout.checked_sub(start.elapsed()) {
        if states.len() == bulbs.len() {
            break;
        }
        let Some(packet) = recv(&listener, &mut buffer, remaining).await else {
            continue;
        };
        if packet.kind != PacketType::LightState {
            continue;
        }
        let reporter = packet.header.target;
        let known = bulbs
            .iter()
            .any(|b| b.mac == reporter && b.addr.ip() == packet.addr.ip());
        if !known {
            continue;
        }
        if let Some(raw) = RawLightState::from_payload(&packet.payload) {
            states.insert(reporter, LightState::from(&raw));
        }
    }

    Ok(bulbs
        .iter()
        .filter_map(|bulb| {
            states.remove(&bulb.mac).map(|state| BulbState {
                bulb: *bulb,
                state,
            })
        })
        .collect())
}

/// Turns `bulbs` on or off. Does not wait for confirmation.
pub async fn set_power(config: &Config, bulbs: &[DiscoveredBulb], is_on: bool) -> Result<()> {
    let level = if is_on { 0xffff } else { 0 };
    send(
        config,
        bulbs,
        PacketType::SetPowerState,
        &[FieldValue::U16(level)],
    )
    .await
}

/// Sets the color of `bulbs` in human units. Does not wait for confirmation.
///
/// `hue` is in degrees, `saturation` and `brightness` in `[0, 1]`. A non-zero
/// `kelvin` selects the white spectrum. The bulbs transition over `fade`.
pub async fn set_state(
    config: &Config,
    bulbs: &[DiscoveredBulb],
    hue: f64,
    saturation: f64,
    brightness: f64,
    kelvin: u16,
    fade: Duration,
) -> Result<()> {
    set_state_raw(
        config,
        bulbs,
        hue_to_raw(hue),
        unit_to_raw(saturation),
        unit_to_raw(brightness),
        kelvin,
        fade,
    )
    .await
}

/// Like [`set_state`] with pre-scaled 16-bit values.
pub async fn set_state_raw(
    config: &Config,
    bulbs: &[DiscoveredBulb],
    hue: u16,
    saturation: u16,
    brightness: u16,
    kelvin: u16,
    fade: Duration,
) -> Result<()> {
    let fade = u32::try_from(fade.as_millis()).unwrap_or(u32::MAX);
    send(
        config,
        bulbs,
        PacketType::SetLightState,
        &[
            FieldValue::U16(hue),
            FieldValue::U16(saturation),
            FieldValue::U16(brightness),
            FieldValue::U16(kelvin),
            FieldValue::U32(fade),
        ],
    )
    .await
}

/// [`find_bulbs`] followed by [`get_state`], sharing one `timeout`.
///
/// Discovery re-broadcasts every `config.retry_delay`.
pub async fn refresh(
    config: &Config,
    expected: Option<usize>,
    timeout: Duration,
) -> Result<Vec<BulbState>> {
    let bulbs = find_bulbs(config, expected, config.retry_delay, timeout).await?;
    if bulbs.is_empty() {
        return Ok(Vec::new());
    }
    get_state(config, &bulbs, timeout).await
}

async fn bind(addr: SocketAddr, action: &str) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|e| Error::socket(action, e))
}

async fn send(
    config: &Config,
    bulbs: &[DiscoveredBulb],
    kind: PacketType,
    values: &[FieldValue],
) -> Result<()> {
    let socket = bind(config.local_addr, "bind sender").await?;
    for bulb in bulbs {
        let packet = kind.encode(bulb.gateway, bulb.mac, values, Some(config.protocol.command))?;
        send_to(&socket, &packet, bulb.addr).await?;
    }
    Ok(())
}

async fn send_to(socket: &UdpSocket, packet: &[u8], addr: SocketAddr) -> Result<()> {
    socket
        .send_to(packet, addr)
        .await
        .map(|_| ())
        .map_err(|e| Error::socket("send_to", e))
}

/// Waits up to `wait` for one decodable inbound packet.
async fn recv(socket: &UdpSocket, buffer: &mut [u8], wait: Duration) -> Option<InboundPacket> {
    match runtime::timeout(wait, socket.recv_from(buffer)).await {
        Ok(Ok((size, addr))) => match decode(&buffer[..size], addr) {
            Ok(Datagram::Known(packet)) => Some(packet),
            Ok(Datagram::Unknown { .. }) => None,
            Err(e) => {
                debug!("dropping datagram from {addr}: {e}");
                None
            }
        },
        Ok(Err(_)) | Err(_) => None,
    }
}

fn advertised_bulb(packet: &InboundPacket) -> Option<DiscoveredBulb> {
    let service = packet.payload.u8("service")?;
    let port = u16::try_from(packet.payload.u32("port")?).ok()?;
    if service != SERVICE_UDP || port == 0 {
        return None;
    }
    Some(DiscoveredBulb {
        gateway: packet.header.gateway,
        mac: packet.header.target,
        addr: SocketAddr::new(packet.addr.ip(), port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_header, parse_payload};
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A free loopback port for the helpers' listening socket.
    fn free_port() -> SocketAddr {
        let probe = std::net::UdpSocket::bind(loopback(0)).unwrap();
        probe.local_addr().unwrap()
    }

    fn config(listen: SocketAddr, gateway: SocketAddr) -> Config {
        Config::new(1)
            .with_listen_addr(listen)
            .with_broadcast_addr(gateway)
            .with_local_addr(loopback(0))
    }

    fn bulb_mac(n: u8) -> Mac {
        Mac::new([0xd0, 0x73, 0xd5, 0, 0, n])
    }

    fn advert(gateway: Mac, bulb: Mac, service: u8, port: u32) -> Vec<u8> {
        PacketType::Gateway
            .encode(
                gateway,
                bulb,
                &[FieldValue::U8(service), FieldValue::U32(port)],
                None,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_find_bulbs_stops_at_expected() {
        let gateway = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        let listen = free_port();
        let config = config(listen, gateway_addr);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, _) = gateway.recv_from(&mut buf).await.unwrap();
            let (header, _) = parse_header(&buf[..n]).unwrap();
            assert_eq!(header.kind(), Some(PacketType::GetGateway));
            assert_eq!(header.protocol, 0x3400);

            let port = gateway_addr.port() as u32;
            let gw = Mac::new([1; 6]);
            // Duplicate and non-UDP advertisements are not counted.
            for packet in [
                advert(gw, bulb_mac(1), SERVICE_UDP, port),
                advert(gw, bulb_mac(1), SERVICE_UDP, port),
                advert(gw, bulb_mac(9), 2, port),
                advert(gw, bulb_mac(2), SERVICE_UDP, port),
            ] {
                gateway.send_to(&packet, listen).await.unwrap();
            }
        });

        let bulbs = find_bulbs(
            &config,
            Some(2),
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        responder.await.unwrap();

        let macs: Vec<Mac> = bulbs.iter().map(|b| b.mac).collect();
        assert_eq!(macs, vec![bulb_mac(1), bulb_mac(2)]);
        assert!(bulbs.iter().all(|b| b.addr == gateway_addr));
    }

    #[tokio::test]
    async fn test_find_bulbs_rebroadcasts_until_timeout() {
        let gateway = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
        let config = config(free_port(), gateway.local_addr().unwrap());

        let start = Instant::now();
        let bulbs = find_bulbs(
            &config,
            None,
            Duration::from_millis(50),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert!(bulbs.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(300));

        let mut buf = [0u8; 128];
        let mut requests = 0;
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(50), gateway.recv_from(&mut buf)).await
        {
            requests += 1;
        }
        assert!(requests > 1);
    }

    #[tokio::test]
    async fn test_get_state_collects_known_bulbs() {
        let gateway = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        let listen = free_port();
        let config = config(listen, gateway_addr);
        let gw = Mac::new([1; 6]);
        let bulbs = [
            DiscoveredBulb {
                gateway: gw,
                mac: bulb_mac(1),
                addr: gateway_addr,
            },
            DiscoveredBulb {
                gateway: gw,
                mac: bulb_mac(2),
                addr: gateway_addr,
            },
        ];

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            for _ in 0..2 {
                let (n, _) = gateway.recv_from(&mut buf).await.unwrap();
                let (header, _) = parse_header(&buf[..n]).unwrap();
                assert_eq!(header.kind(), Some(PacketType::GetLightState));
                assert_eq!(header.gateway, gw);
                // Bulb 2 stays silent; a stranger answers instead.
                let reporter = if header.target == bulb_mac(1) {
                    bulb_mac(1)
                } else {
                    bulb_mac(7)
                };
                let values = [
                    FieldValue::U16(0x7fff),
                    FieldValue::U16(0xffff),
                    FieldValue::U16(0),
                    FieldValue::U16(2700),
                    FieldValue::U16(0),
                    FieldValue::U16(0xffff),
                    FieldValue::Bytes(b"Kitchen".to_vec()),
                    FieldValue::Bytes(vec![0; 8]),
                ];
                let report = PacketType::LightState
                    .encode(gw, reporter, &values, None)
                    .unwrap();
                gateway.send_to(&report, listen).await.unwrap();
            }
        });

        let states = get_state(&config, &bulbs, Duration::from_millis(500))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(states.len(), 1);
        assert_eq!(states[0].bulb, bulbs[0]);
        assert_eq!(states[0].state.label, "Kitchen");
        assert_eq!(states[0].state.kelvin, 2700);
        assert!(states[0].state.is_on);
    }

    #[tokio::test]
    async fn test_set_state_addresses_each_bulb() {
        let gateway = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        let config = config(free_port(), gateway_addr);
        let bulb = DiscoveredBulb {
            gateway: Mac::new([1; 6]),
            mac: bulb_mac(3),
            addr: gateway_addr,
        };

        set_state(
            &config,
            &[bulb],
            180.0,
            1.0,
            0.0,
            0,
            Duration::from_millis(750),
        )
        .await
        .unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = gateway.recv_from(&mut buf).await.unwrap();
        let (header, rest) = parse_header(&buf[..n]).unwrap();
        assert_eq!(header.target, bulb.mac);
        assert_eq!(header.gateway, bulb.gateway);
        assert_eq!(header.protocol, 0x1400);
        let payload = parse_payload(rest, PacketType::SetLightState.layout()).unwrap();
        assert_eq!(payload.u16("hue"), Some(0x7fff));
        assert_eq!(payload.u16("saturation"), Some(0xffff));
        assert_eq!(payload.u32("fade"), Some(750));
    }

    #[tokio::test]
    async fn test_set_power_payload() {
        let gateway = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        let config = config(free_port(), gateway_addr);
        let bulb = DiscoveredBulb {
            gateway: Mac::new([1; 6]),
            mac: bulb_mac(4),
            addr: gateway_addr,
        };

        set_power(&config, &[bulb], true).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = gateway.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[n - 2..n], &[0xff, 0xff]);
    }

    #[tokio::test]
    async fn test_refresh_without_bulbs() {
        let gateway = tokio::net::UdpSocket::bind(loopback(0)).await.unwrap();
        let config = config(free_port(), gateway.local_addr().unwrap())
            .with_retries(1, Duration::from_millis(50));
        let states = refresh(&config, Some(1), Duration::from_millis(150))
            .await
            .unwrap();
        assert!(states.is_empty());
    }
}
