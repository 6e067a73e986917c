//! Wire format for GRE encapsulation and the GRE tunnel control protocol.
//!
//! All multi-byte fields are big-endian. Control messages and data packets
//! share the same GRE header; they are told apart by the protocol field.
//!
//! # GRE Header
//!
//! - Flags/version (2 bytes): `0x2000` (key present) or `0x3000` (key and
//!   sequence present). Every other value is rejected.
//! - Protocol (2 bytes): `0x0101` for control messages, an EtherType for data
//! - Key (4 bytes): bonding key of the session
//! - Sequence (4 bytes, optional): only with flags `0x3000`
//!
//! # Control Message
//!
//! After an 8-byte GRE header:
//! - Type byte: message type in the high nibble, tunnel type in the low nibble
//! - Attributes: `id (1 byte) | length (2 bytes) | value (length bytes)`

use std::fmt;
use std::net::Ipv6Addr;
use std::time::Duration;

/// GRE protocol number carried by control messages
pub const GRECP_PROTO: u16 = 0x0101;

/// Flags/version with only the key bit set
pub const GRE_FLAGS_KEY: u16 = 0x2000;

/// Flags/version with the key and sequence bits set
pub const GRE_FLAGS_KEY_SEQ: u16 = 0x3000;

/// EtherType for IPv4 payloads
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType for IPv6 payloads
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Size of the type/tunnel byte following the GRE header
pub const GRECP_HEADER_SIZE: usize = 1;

/// Size of an attribute prefix (id + length)
pub const ATTRIBUTE_PREFIX_SIZE: usize = 3;

/// Largest packet we build or accept
pub const MAX_PACKET_SIZE: usize = 1500;

/// Attribute identifiers used by this client.
pub mod attr {
    pub const H_IPV4_ADDRESS: u8 = 1;
    pub const H_IPV6_ADDRESS: u8 = 2;
    pub const CLIENT_IDENTIFICATION_NAME: u8 = 3;
    pub const SESSION_ID: u8 = 4;
    pub const TIMESTAMP: u8 = 5;
    pub const BYPASS_TRAFFIC_RATE: u8 = 6;
    pub const FILTER_LIST_PACKAGE: u8 = 8;
    pub const BYPASS_BANDWIDTH_CHECK_INTERVAL: u8 = 10;
    pub const ACTIVE_HELLO_INTERVAL: u8 = 14;
    pub const HELLO_RETRY_TIMES: u8 = 15;
    pub const ERROR_CODE: u8 = 17;
    pub const DSL_LINK_FAILURE: u8 = 18;
    pub const LTE_LINK_FAILURE: u8 = 19;
    pub const BONDING_KEY_VALUE: u8 = 20;
    pub const FILTER_LIST_PACKAGE_ACK: u8 = 30;
    pub const TUNNEL_VERIFICATION: u8 = 35;
    /// Not in the RFC; every message from the HAAP ends with it
    pub const PADDING: u8 = 255;
}

/// Control message type (high nibble of the type byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Accept,
    Deny,
    Hello,
    Teardown,
    Notify,
}

impl MessageType {
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Accept),
            3 => Some(Self::Deny),
            4 => Some(Self::Hello),
            5 => Some(Self::Teardown),
            6 => Some(Self::Notify),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            Self::Request => 1,
            Self::Accept => 2,
            Self::Deny => 3,
            Self::Hello => 4,
            Self::Teardown => 5,
            Self::Notify => 6,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Accept => "accept",
            Self::Deny => "deny",
            Self::Hello => "hello",
            Self::Teardown => "tear down",
            Self::Notify => "notify",
        };
        f.write_str(name)
    }
}

/// Tunnel type (low nibble of the type byte).
///
/// The values on the wire are 0 and 8, not the 1 and 2 the RFC lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelType {
    /// Primary cellular link
    Lte,
    /// Secondary broadband link
    Dsl,
}

impl TunnelType {
    pub const ALL: [TunnelType; 2] = [TunnelType::Lte, TunnelType::Dsl];

    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Lte),
            8 => Some(Self::Dsl),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            Self::Lte => 0,
            Self::Dsl => 8,
        }
    }

    /// The other link of the pair
    pub fn peer(self) -> Self {
        match self {
            Self::Lte => Self::Dsl,
            Self::Dsl => Self::Lte,
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lte => f.write_str("LTE"),
            Self::Dsl => f.write_str("DSL"),
        }
    }
}

/// GRE header as used on both planes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreHeader {
    /// Payload protocol (`GRECP_PROTO` or an EtherType)
    pub protocol: u16,
    /// Bonding key
    pub key: u32,
    /// Sequence number, present only on sequenced data packets
    pub sequence: Option<u32>,
}

impl GreHeader {
    /// Size without a sequence number
    pub const SIZE: usize = 8;

    /// Size with a sequence number
    pub const SIZE_WITH_SEQUENCE: usize = 12;

    pub fn new(protocol: u16, key: u32, sequence: Option<u32>) -> Self {
        Self {
            protocol,
            key,
            sequence,
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.sequence.is_some() {
            Self::SIZE_WITH_SEQUENCE
        } else {
            Self::SIZE
        }
    }

    pub fn flags_and_version(&self) -> u16 {
        if self.sequence.is_some() {
            GRE_FLAGS_KEY_SEQ
        } else {
            GRE_FLAGS_KEY
        }
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.flags_and_version().to_be_bytes());
        buf.extend_from_slice(&self.protocol.to_be_bytes());
        buf.extend_from_slice(&self.key.to_be_bytes());
        if let Some(sequence) = self.sequence {
            buf.extend_from_slice(&sequence.to_be_bytes());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a header, returning it along with the payload offset
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let flags = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol = u16::from_be_bytes([buf[2], buf[3]]);
        let key = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        match flags {
            GRE_FLAGS_KEY => Ok((Self::new(protocol, key, None), Self::SIZE)),
            GRE_FLAGS_KEY_SEQ => {
                if buf.len() < Self::SIZE_WITH_SEQUENCE {
                    return Err(ProtocolError::InvalidLength {
                        expected: Self::SIZE_WITH_SEQUENCE,
                        actual: buf.len(),
                    });
                }
                let sequence = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
                Ok((
                    Self::new(protocol, key, Some(sequence)),
                    Self::SIZE_WITH_SEQUENCE,
                ))
            }
            other => Err(ProtocolError::InvalidFlags(other)),
        }
    }
}

/// Read the protocol field without validating anything else.
///
/// Used to route packets between the control and data planes.
pub fn peek_protocol(buf: &[u8]) -> Option<u16> {
    buf.get(2..4).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// A single attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub id: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(id: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }

    /// Attribute carrying no value
    pub fn flag(id: u8) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn from_u32(id: u8, value: u32) -> Self {
        Self::new(id, value.to_be_bytes().to_vec())
    }

    pub fn padding() -> Self {
        Self::flag(attr::PADDING)
    }

    /// First four bytes of the value as a big-endian integer
    pub fn as_u32(&self) -> Option<u32> {
        let b = self.value.get(0..4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn as_ipv6(&self) -> Option<Ipv6Addr> {
        let octets: [u8; 16] = self.value.as_slice().try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }

    pub fn as_timestamp(&self) -> Option<HelloTimestamp> {
        HelloTimestamp::decode(&self.value)
    }
}

/// Decode one attribute from the start of `buf`.
///
/// Returns the attribute and the number of bytes it occupied.
pub fn decode_attribute(buf: &[u8]) -> Result<(Attribute, usize), ProtocolError> {
    if buf.len() < ATTRIBUTE_PREFIX_SIZE {
        return Err(ProtocolError::Malformed {
            needed: ATTRIBUTE_PREFIX_SIZE,
            remaining: buf.len(),
        });
    }

    let id = buf[0];
    let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    let end = ATTRIBUTE_PREFIX_SIZE + length;
    let value = buf
        .get(ATTRIBUTE_PREFIX_SIZE..end)
        .ok_or(ProtocolError::Malformed {
            needed: end,
            remaining: buf.len(),
        })?;

    Ok((Attribute::new(id, value), end))
}

/// Encode one attribute
pub fn encode_attribute(id: u8, value: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(ATTRIBUTE_PREFIX_SIZE + value.len());
    encode_attribute_into(&mut buf, id, value)?;
    Ok(buf)
}

fn encode_attribute_into(buf: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<(), ProtocolError> {
    let length = u16::try_from(value.len()).map_err(|_| ProtocolError::AttributeTooLarge(value.len()))?;
    buf.push(id);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

/// Decode attributes until the buffer ends or one is malformed.
///
/// A malformed attribute ends the walk; what was decoded before it is kept.
pub fn decode_attributes(mut buf: &[u8]) -> Vec<Attribute> {
    let mut attributes = Vec::new();
    while !buf.is_empty() {
        match decode_attribute(buf) {
            Ok((attribute, consumed)) => {
                attributes.push(attribute);
                buf = &buf[consumed..];
            }
            Err(e) => {
                tracing::error!("Malformed attribute, ignoring rest of message: {e}");
                break;
            }
        }
    }
    attributes
}

/// Timestamp carried by hello messages: seconds and milliseconds of uptime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloTimestamp {
    pub seconds: u32,
    pub milliseconds: u32,
}

impl HelloTimestamp {
    pub const SIZE: usize = 8;

    pub fn from_uptime(uptime: Duration) -> Self {
        Self {
            seconds: uptime.as_secs() as u32,
            milliseconds: uptime.subsec_millis(),
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.seconds))
            + Duration::from_millis(u64::from(self.milliseconds))
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.milliseconds.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let b = buf.get(0..Self::SIZE)?;
        Some(Self {
            seconds: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            milliseconds: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        })
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrecpMessage {
    pub message_type: MessageType,
    pub tunnel_type: TunnelType,
    /// Key from the GRE header
    pub key: u32,
    pub attributes: Vec<Attribute>,
}

impl GrecpMessage {
    pub fn new(message_type: MessageType, tunnel_type: TunnelType, key: u32) -> Self {
        Self {
            message_type,
            tunnel_type,
            key,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// First attribute with the given id
    pub fn attribute(&self, id: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.id == id)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        GreHeader::new(GRECP_PROTO, self.key, None).encode_into(&mut buf);
        buf.push((self.message_type.nibble() << 4) | self.tunnel_type.nibble());
        for attribute in &self.attributes {
            encode_attribute_into(&mut buf, attribute.id, &attribute.value)?;
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PayloadTooLarge(buf.len()));
        }
        Ok(buf)
    }

    /// Decode a full control packet starting at the GRE header.
    ///
    /// Header checks are strict; a malformed attribute only truncates the
    /// attribute list.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (gre, offset) = GreHeader::decode(buf)?;
        if gre.sequence.is_some() {
            return Err(ProtocolError::InvalidFlags(GRE_FLAGS_KEY_SEQ));
        }
        if gre.protocol != GRECP_PROTO {
            return Err(ProtocolError::NotControl(gre.protocol));
        }

        let type_byte = *buf.get(offset).ok_or(ProtocolError::InvalidLength {
            expected: offset + GRECP_HEADER_SIZE,
            actual: buf.len(),
        })?;
        let tunnel_type = TunnelType::from_nibble(type_byte & 0x0f)
            .ok_or(ProtocolError::InvalidTunnelType(type_byte & 0x0f))?;
        let message_type = MessageType::from_nibble(type_byte >> 4)
            .ok_or(ProtocolError::UnknownMessageType(type_byte >> 4))?;

        Ok(Self {
            message_type,
            tunnel_type,
            key: gre.key,
            attributes: decode_attributes(&buf[offset + GRECP_HEADER_SIZE..]),
        })
    }
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid GRE flags/version: 0x{0:04X}")]
    InvalidFlags(u16),

    #[error("Malformed attribute: needs {needed} bytes, {remaining} remaining")]
    Malformed { needed: usize, remaining: usize },

    #[error("Attribute value too large: {0} bytes")]
    AttributeTooLarge(usize),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Not a control message: protocol 0x{0:04X}")]
    NotControl(u16),

    #[error("Invalid tunnel type: {0}")]
    InvalidTunnelType(u8),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Invalid GRE key: 0x{0:08X}")]
    InvalidKey(u32),

    #[error("Unexpected source address: {0}")]
    UnexpectedSource(Ipv6Addr),
}
