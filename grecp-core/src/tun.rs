//! Local tunnel device.
//!
//! Frames exchanged between the bridge and the device carry a 4-byte
//! packet information header in front of the IP packet:
//!
//! - Flags (2 bytes): always zero
//! - Protocol (2 bytes): EtherType of the packet, big-endian
//!
//! The GRE protocol field maps onto the EtherType one to one, so
//! decapsulation only has to move two bytes.

use crate::proto::{ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use std::io;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxTunDevice;

/// Packet information header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub flags: u16,
    pub ethertype: u16,
}

impl PacketInfo {
    pub const SIZE: usize = 4;

    pub fn new(ethertype: u16) -> Self {
        Self {
            flags: 0,
            ethertype,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.flags.to_be_bytes());
        buf[2..4].copy_from_slice(&self.ethertype.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let b = buf.get(0..Self::SIZE)?;
        Some(Self {
            flags: u16::from_be_bytes([b[0], b[1]]),
            ethertype: u16::from_be_bytes([b[2], b[3]]),
        })
    }
}

/// Build a frame from an EtherType and an IP packet
pub fn frame(ethertype: u16, packet: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PacketInfo::SIZE + packet.len());
    buf.extend_from_slice(&PacketInfo::new(ethertype).encode());
    buf.extend_from_slice(packet);
    buf
}

/// Split a frame into its EtherType and IP packet
pub fn split_frame(frame: &[u8]) -> Option<(u16, &[u8])> {
    let info = PacketInfo::decode(frame)?;
    Some((info.ethertype, &frame[PacketInfo::SIZE..]))
}

/// EtherType implied by the IP version nibble
pub fn ethertype_of(packet: &[u8]) -> Option<u16> {
    match packet.first()? >> 4 {
        4 => Some(ETHERTYPE_IPV4),
        6 => Some(ETHERTYPE_IPV6),
        _ => None,
    }
}

/// Parameters the tunnel device is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub name: String,
    pub mtu: u16,
}

/// Creates and removes the local tunnel device.
///
/// The control loop calls `create` when the first link comes up and
/// `destroy` when the last one goes down.
pub trait TunnelLifecycle: Send {
    fn create(&mut self, params: &TunnelParams) -> io::Result<()>;

    fn destroy(&mut self) -> io::Result<()>;
}
