//! Binary packet codec.
//!
//! Every packet starts with a fixed 36-byte little-endian header followed by a
//! payload whose layout is selected by the packet type code:
//!
//! ```text
//! size:u16 protocol:u16 pad:4 target:6 pad:2 gateway:6 pad:2 timestamp:u64 type:u16 pad:2
//! ```
//!
//! Reserved bytes are always written as zero and ignored when reading.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::errors::Error;
use crate::types::Mac;
use FieldKind::{Bytes, U8, U16, U32};

type Result<T> = std::result::Result<T, Error>;

/// Size of the common header in bytes.
pub const HEADER_SIZE: usize = 36;

/// Well-known UDP port for both discovery and commands.
pub const LIFX_PORT: u16 = 56700;

/// Protocol tag used for the broadcast discovery request.
pub const PROTOCOL_DISCOVERY: u16 = 0x3400;

/// Protocol tag used for addressed commands.
pub const PROTOCOL_COMMAND: u16 = 0x1400;

/// Service id a gateway advertises for its UDP endpoint.
pub const SERVICE_UDP: u8 = 1;

/// Packet type codes with a known payload layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Serialize, Deserialize)]
#[repr(u16)]
pub enum PacketType {
    /// Broadcast request asking gateways to advertise themselves.
    GetGateway = 0x02,
    /// Gateway advertisement (service id and port).
    Gateway = 0x03,
    SetPowerState = 0x15,
    /// Power state report from a bulb.
    PowerState = 0x16,
    GetLightState = 0x65,
    SetLightState = 0x66,
    /// Light state report from a bulb.
    LightState = 0x6b,
}

impl PacketType {
    pub fn from_code(code: u16) -> Option<Self> {
        PacketType::iter().find(|kind| kind.code() == code)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this type is sent by gateways and bulbs rather than by clients.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            PacketType::Gateway | PacketType::PowerState | PacketType::LightState
        )
    }

    pub fn layout(self) -> &'static Layout {
        match self {
            PacketType::GetGateway => &EMPTY_LAYOUT,
            PacketType::Gateway => &GATEWAY_LAYOUT,
            PacketType::SetPowerState => &SET_POWER_STATE_LAYOUT,
            PacketType::PowerState => &POWER_STATE_LAYOUT,
            PacketType::GetLightState => &EMPTY_LAYOUT,
            PacketType::SetLightState => &SET_LIGHT_STATE_LAYOUT,
            PacketType::LightState => &LIGHT_STATE_LAYOUT,
        }
    }

    /// Builds a packet of this type using its own payload layout.
    pub fn encode(
        self,
        gateway: Mac,
        target: Mac,
        values: &[FieldValue],
        protocol: Option<u16>,
    ) -> Result<Vec<u8>> {
        build_packet(self, gateway, target, self.layout(), values, protocol)
    }
}

/// Payload layout for a raw type code.
pub fn layout_for(code: u16) -> Result<&'static Layout> {
    PacketType::from_code(code)
        .map(PacketType::layout)
        .ok_or(Error::UnknownPacketType(code))
}

impl From<PacketType> for u16 {
    fn from(kind: PacketType) -> Self {
        kind.code()
    }
}

/// Encoding of a single payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    /// Fixed-width byte string.
    Bytes(usize),
    /// Reserved bytes: zero on encode, skipped on decode, never named.
    Pad(usize),
}

impl FieldKind {
    pub fn size(self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::U16 => 2,
            FieldKind::U32 => 4,
            FieldKind::U64 => 8,
            FieldKind::Bytes(n) | FieldKind::Pad(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Field { name, kind }
    }

    pub const fn pad(len: usize) -> Self {
        Field {
            name: "",
            kind: FieldKind::Pad(len),
        }
    }
}

/// An ordered list of fixed-width payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    fields: &'static [Field],
}

impl Layout {
    pub const fn new(fields: &'static [Field]) -> Self {
        Layout { fields }
    }

    pub fn fields(&self) -> &'static [Field] {
        self.fields
    }

    /// Encoded payload size in bytes.
    pub fn size(&self) -> usize {
        self.fields.iter().map(|f| f.kind.size()).sum()
    }

    /// Names of the value-carrying fields, in wire order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.kind, FieldKind::Pad(_)))
            .map(|f| f.name)
    }
}

pub static EMPTY_LAYOUT: Layout = Layout::new(&[]);

pub static GATEWAY_LAYOUT: Layout =
    Layout::new(&[Field::new("service", U8), Field::new("port", U32)]);

pub static POWER_STATE_LAYOUT: Layout = Layout::new(&[Field::new("is_on", U16)]);

pub static LIGHT_STATE_LAYOUT: Layout = Layout::new(&[
    Field::new("hue", U16),
    Field::new("saturation", U16),
    Field::new("brightness", U16),
    Field::new("kelvin", U16),
    Field::new("dim", U16),
    Field::new("power", U16),
    Field::new("label", Bytes(32)),
    Field::new("tags", Bytes(8)),
]);

pub static SET_POWER_STATE_LAYOUT: Layout = Layout::new(&[Field::new("is_on", U16)]);

pub static SET_LIGHT_STATE_LAYOUT: Layout = Layout::new(&[
    Field::pad(1),
    Field::new("hue", U16),
    Field::new("saturation", U16),
    Field::new("brightness", U16),
    Field::new("kelvin", U16),
    Field::new("fade", U32),
]);

/// A decoded payload field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

/// Named payload fields decoded from a packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(BTreeMap<String, FieldValue>);

impl Payload {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn u8(&self, name: &str) -> Option<u8> {
        match self.get(name)? {
            FieldValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn u16(&self, name: &str) -> Option<u16> {
        match self.get(name)? {
            FieldValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn u32(&self, name: &str) -> Option<u32> {
        match self.get(name)? {
            FieldValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            FieldValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            FieldValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Values in the order `layout` lists its named fields.
    pub fn values(&self, layout: &Layout) -> Option<Vec<FieldValue>> {
        layout.names().map(|name| self.get(name).cloned()).collect()
    }
}

/// The fixed header common to all packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub size: u16,
    pub protocol: u16,
    /// Addressed bulb; [`Mac::ALL`] for every bulb.
    pub target: Mac,
    pub gateway: Mac,
    pub timestamp: u64,
    pub packet_type: u16,
}

impl Header {
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_code(self.packet_type)
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u16::<LittleEndian>(self.size)?;
        buf.write_u16::<LittleEndian>(self.protocol)?;
        buf.write_all(&[0; 4])?;
        buf.write_all(&self.target.bytes())?;
        buf.write_all(&[0; 2])?;
        buf.write_all(&self.gateway.bytes())?;
        buf.write_all(&[0; 2])?;
        buf.write_u64::<LittleEndian>(self.timestamp)?;
        buf.write_u16::<LittleEndian>(self.packet_type)?;
        buf.write_all(&[0; 2])
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let size = cursor.read_u16::<LittleEndian>()?;
        let protocol = cursor.read_u16::<LittleEndian>()?;
        skip(cursor, 4)?;
        let target = read_mac(cursor)?;
        skip(cursor, 2)?;
        let gateway = read_mac(cursor)?;
        skip(cursor, 2)?;
        let timestamp = cursor.read_u64::<LittleEndian>()?;
        let packet_type = cursor.read_u16::<LittleEndian>()?;
        skip(cursor, 2)?;
        Ok(Header {
            size,
            protocol,
            target,
            gateway,
            timestamp,
            packet_type,
        })
    }
}

fn skip(cursor: &mut Cursor<&[u8]>, len: usize) -> std::io::Result<()> {
    let mut pad = [0u8; 8];
    cursor.read_exact(&mut pad[..len])
}

fn read_mac(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Mac> {
    let mut mac = [0u8; 6];
    cursor.read_exact(&mut mac)?;
    Ok(Mac::new(mac))
}

/// Splits a datagram into its header and the uninterpreted payload bytes.
pub fn parse_header(bytes: &[u8]) -> Result<(Header, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::decode(HEADER_SIZE, bytes.len()));
    }
    let mut cursor = Cursor::new(&bytes[..HEADER_SIZE]);
    let header =
        Header::read_from(&mut cursor).map_err(|_| Error::decode(HEADER_SIZE, bytes.len()))?;
    Ok((header, &bytes[HEADER_SIZE..]))
}

/// Decodes payload bytes into named fields according to `layout`.
///
/// The byte length must match the layout size exactly.
pub fn parse_payload(bytes: &[u8], layout: &Layout) -> Result<Payload> {
    let expected = layout.size();
    if bytes.len() != expected {
        return Err(Error::decode(expected, bytes.len()));
    }

    let mut cursor = Cursor::new(bytes);
    let mut fields = BTreeMap::new();
    for field in layout.fields() {
        let value = read_field(&mut cursor, field.kind)
            .map_err(|_| Error::decode(expected, bytes.len()))?;
        if let Some(value) = value {
            fields.insert(field.name.to_string(), value);
        }
    }
    Ok(Payload(fields))
}

fn read_field(cursor: &mut Cursor<&[u8]>, kind: FieldKind) -> std::io::Result<Option<FieldValue>> {
    let value = match kind {
        FieldKind::U8 => FieldValue::U8(cursor.read_u8()?),
        FieldKind::U16 => FieldValue::U16(cursor.read_u16::<LittleEndian>()?),
        FieldKind::U32 => FieldValue::U32(cursor.read_u32::<LittleEndian>()?),
        FieldKind::U64 => FieldValue::U64(cursor.read_u64::<LittleEndian>()?),
        FieldKind::Bytes(len) => {
            let mut buf = vec![0u8; len];
            cursor.read_exact(&mut buf)?;
            FieldValue::Bytes(buf)
        }
        FieldKind::Pad(len) => {
            let mut buf = vec![0u8; len];
            cursor.read_exact(&mut buf)?;
            return Ok(None);
        }
    };
    Ok(Some(value))
}

/// Builds a complete packet.
///
/// `values` are matched positionally against the named fields of `layout`.
/// The protocol tag defaults to [`PROTOCOL_COMMAND`]; the timestamp is always zero.
pub fn build_packet(
    packet_type: impl Into<u16>,
    gateway: Mac,
    target: Mac,
    layout: &Layout,
    values: &[FieldValue],
    protocol: Option<u16>,
) -> Result<Vec<u8>> {
    let size = HEADER_SIZE + layout.size();
    let header = Header {
        size: u16::try_from(size)
            .map_err(|_| Error::Encode(format!("packet size {size} exceeds u16")))?,
        protocol: protocol.unwrap_or(PROTOCOL_COMMAND),
        target,
        gateway,
        timestamp: 0,
        packet_type: packet_type.into(),
    };

    let mut buf = Vec::with_capacity(size);
    header.write_to(&mut buf).map_err(io_encode)?;

    let mut values = values.iter();
    for field in layout.fields() {
        if let FieldKind::Pad(len) = field.kind {
            buf.resize(buf.len() + len, 0);
            continue;
        }
        let value = values
            .next()
            .ok_or_else(|| Error::Encode(format!("missing value for field {}", field.name)))?;
        write_field(&mut buf, field, value)?;
    }
    if values.next().is_some() {
        return Err(Error::Encode(format!(
            "too many values for a {}-field layout",
            layout.names().count()
        )));
    }

    Ok(buf)
}

fn write_field(buf: &mut Vec<u8>, field: &Field, value: &FieldValue) -> Result<()> {
    match (field.kind, value) {
        (FieldKind::U8, FieldValue::U8(v)) => buf.write_u8(*v).map_err(io_encode),
        (FieldKind::U16, FieldValue::U16(v)) => {
            buf.write_u16::<LittleEndian>(*v).map_err(io_encode)
        }
        (FieldKind::U32, FieldValue::U32(v)) => {
            buf.write_u32::<LittleEndian>(*v).map_err(io_encode)
        }
        (FieldKind::U64, FieldValue::U64(v)) => {
            buf.write_u64::<LittleEndian>(*v).map_err(io_encode)
        }
        // Short byte strings are NUL padded, long ones truncated.
        (FieldKind::Bytes(len), FieldValue::Bytes(v)) => {
            let take = v.len().min(len);
            buf.extend_from_slice(&v[..take]);
            buf.resize(buf.len() + (len - take), 0);
            Ok(())
        }
        (kind, value) => Err(Error::Encode(format!(
            "field {} expects {kind:?}, got {value:?}",
            field.name
        ))),
    }
}

fn io_encode(err: std::io::Error) -> Error {
    Error::Encode(err.to_string())
}

/// Lowercase hex rendering of packet bytes, for logs.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parses hex text (whitespace ignored) back into bytes.
pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}
