//! Raw GRE transport, one socket per access link.
//!
//! This module handles:
//! - Raw IPv6 sockets for IP protocol 47, bound to the link's endpoint address
//! - Resolving an interface's global IPv6 address
//! - Splitting received traffic into control and data planes
//!
//! The kernel strips the IPv6 header on raw IPv6 sockets, so received
//! buffers start at the GRE header.

use crate::proto::{peek_protocol, GRECP_PROTO};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fs;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::path::Path;
use std::time::Duration;

/// IP protocol number of GRE
pub const IPPROTO_GRE: i32 = 47;

/// Read timeout of link sockets
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Where the kernel lists interface IPv6 addresses
pub const IF_INET6_PATH: &str = "/proc/net/if_inet6";

/// Send and receive GRE packets on one link
pub trait NetworkDevice: Send + Sync {
    /// Send a GRE packet to `destination`
    fn send(&self, packet: &[u8], destination: Ipv6Addr) -> io::Result<()>;

    /// Receive one GRE packet.
    ///
    /// Returns `None` when the read timeout elapsed without traffic.
    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Ipv6Addr)>>;
}

/// Raw GRE socket bound to one link
pub struct GreSocket {
    socket: Socket,
    local: Ipv6Addr,
}

impl GreSocket {
    /// Open a raw GRE socket.
    ///
    /// Binding to `local` pins the source address of everything sent.
    /// `device` additionally restricts the socket to one interface.
    pub fn open(local: Ipv6Addr, device: Option<&str>, read_timeout: Duration) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::from(IPPROTO_GRE)))?;

        if let Some(device) = device {
            socket.bind_device(Some(device.as_bytes()))?;
        }
        socket.set_read_timeout(Some(read_timeout))?;
        socket.bind(&SocketAddrV6::new(local, 0, 0, 0).into())?;

        tracing::debug!("Opened raw GRE socket on {local}");
        Ok(Self { socket, local })
    }

    pub fn local_addr(&self) -> Ipv6Addr {
        self.local
    }
}

impl NetworkDevice for GreSocket {
    fn send(&self, packet: &[u8], destination: Ipv6Addr) -> io::Result<()> {
        let addr = SockAddr::from(SocketAddrV6::new(destination, 0, 0, 0));
        let sent = self.socket.send_to(packet, &addr)?;
        if sent != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("Short send: {} of {} bytes", sent, packet.len()),
            ));
        }
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Ipv6Addr)>> {
        // SAFETY: `u8` and `MaybeUninit<u8>` share a layout, and `recv_from`
        // never writes uninitialized bytes into the buffer.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };

        match self.socket.recv_from(uninit) {
            Ok((len, addr)) => match addr.as_socket_ipv6() {
                Some(source) => Ok(Some((len, *source.ip()))),
                None => Ok(None),
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Plane a received packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Control,
    Data,
}

/// Route a received packet, dropping anything not from the HAAP
pub fn demultiplex(packet: &[u8], source: Ipv6Addr, haap_ip: Ipv6Addr) -> Option<Plane> {
    if source != haap_ip {
        tracing::trace!("Ignoring packet from unexpected source {source}");
        return None;
    }
    match peek_protocol(packet)? {
        GRECP_PROTO => Some(Plane::Control),
        _ => Some(Plane::Data),
    }
}

/// Find the first global address of `interface` in if_inet6 contents
pub fn parse_if_inet6(contents: &str, interface: &str) -> Option<Ipv6Addr> {
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [addr, _index, _prefix, scope, _flags, name] = fields.as_slice() else {
            return None;
        };
        if *name != interface || u8::from_str_radix(scope, 16).ok()? != 0 {
            return None;
        }
        u128::from_str_radix(addr, 16).ok().map(Ipv6Addr::from)
    })
}

/// Resolve the tunnel endpoint address of a link.
///
/// A literal IPv6 address is returned as is.
pub fn resolve_interface_ipv6(interface: &str) -> io::Result<Ipv6Addr> {
    resolve_interface_ipv6_from(interface, Path::new(IF_INET6_PATH))
}

pub fn resolve_interface_ipv6_from(interface: &str, path: &Path) -> io::Result<Ipv6Addr> {
    if let Ok(ip) = interface.parse::<Ipv6Addr>() {
        return Ok(ip);
    }

    let contents = fs::read_to_string(path)?;
    parse_if_inet6(&contents, interface).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("No global IPv6 address on interface '{interface}'"),
        )
    })
}

/// An interface name is given, not a literal address
pub fn is_interface_name(interface: &str) -> bool {
    interface.parse::<Ipv6Addr>().is_err()
}
