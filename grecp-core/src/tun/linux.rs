//! Linux TUN device implementation.
//!
//! Wraps a `tun-rs` device without packet information and adds or strips
//! the 4-byte header the bridge works with.
//!
//! # Requirements
//!
//! - Root privileges (or `CAP_NET_ADMIN`) for device creation
//! - `/dev/net/tun` must be accessible

use super::{ethertype_of, split_frame, PacketInfo, TunnelParams};
use std::io;

/// Linux TUN device implementation
pub struct LinuxTunDevice {
    name: String,
    mtu: u16,
    device: tun_rs::AsyncDevice,
}

impl LinuxTunDevice {
    /// Create and bring up the device.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(params: &TunnelParams) -> io::Result<Self> {
        use tun_rs::DeviceBuilder;

        let device = DeviceBuilder::new()
            .name(&params.name)
            .mtu(params.mtu)
            .build_async()
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!(
                        "Failed to create TUN device (root privileges required): {}",
                        e
                    ),
                )
            })?;

        let actual_name = device
            .name()
            .map_err(|e| io::Error::other(format!("Failed to get device name: {}", e)))?;

        tracing::info!(
            "Tunnel interface '{}' created with MTU {}",
            actual_name,
            params.mtu
        );

        Ok(Self {
            name: actual_name,
            mtu: params.mtu,
            device,
        })
    }

    /// Read one packet and return it as a frame in `buf`.
    ///
    /// Packets that are neither IPv4 nor IPv6 get EtherType 0.
    pub async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() <= PacketInfo::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Frame buffer too small",
            ));
        }

        let len = self.device.recv(&mut buf[PacketInfo::SIZE..]).await?;
        let packet = &buf[PacketInfo::SIZE..PacketInfo::SIZE + len];
        let info = PacketInfo::new(ethertype_of(packet).unwrap_or(0));
        buf[..PacketInfo::SIZE].copy_from_slice(&info.encode());
        Ok(PacketInfo::SIZE + len)
    }

    /// Write a frame's IP packet to the device
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let (_, packet) = split_frame(frame).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Frame shorter than header")
        })?;

        if packet.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot write empty packet",
            ));
        }

        if packet.len() > usize::from(self.mtu) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Packet too large for MTU: {} bytes (MTU: {})",
                    packet.len(),
                    self.mtu
                ),
            ));
        }

        let written = self.device.send(packet).await?;
        if written != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("Short write: {} of {} bytes", written, packet.len()),
            ));
        }
        Ok(())
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LinuxTunDevice {
    fn drop(&mut self) {
        tracing::info!("Tunnel interface '{}' destroyed", self.name);
    }
}
