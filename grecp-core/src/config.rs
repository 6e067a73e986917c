//! Client configuration.
//!
//! Every field has a default so a partial TOML file is enough; `validate`
//! catches values the protocol or the kernel would reject later.

use crate::reorder::ReorderPolicy;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest MTU an IPv6 link may have
pub const MIN_TUNNEL_MTU: u16 = 1280;

/// 1500 minus the IPv6 header (40) and the GRE header with sequence (12)
pub const MAX_TUNNEL_MTU: u16 = 1448;

/// PPPoE overhead on the DSL link
pub const PPPOE_OVERHEAD: u16 = 8;

/// Width of the client identification attribute
pub const CLIENT_IDENTIFICATION_LEN: usize = 40;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Configuration validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Tunnel interface MTU {0} out of range ({MIN_TUNNEL_MTU}..={MAX_TUNNEL_MTU})")]
    MtuOutOfRange(u16),

    #[error("Client identification is {0} bytes, maximum is {CLIENT_IDENTIFICATION_LEN}")]
    ClientIdentificationTooLong(usize),

    #[error("Interface name '{0}' is too long (maximum {MAX_INTERFACE_NAME_LEN} bytes)")]
    InterfaceNameTooLong(String),

    #[error("Interface name must not be empty")]
    EmptyInterfaceName,

    #[error("Tick interval must be non-zero")]
    ZeroTickInterval,

    #[error("Unknown log level '{0}'")]
    UnknownLogLevel(String),
}

/// DHCP helper settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    /// Run udhcpc for an IPv4 lease
    pub ipv4: bool,
    /// Run udhcpc6 for an IPv6 prefix
    pub ipv6: bool,
    /// Busybox binary providing both applets
    pub busybox_path: PathBuf,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
            busybox_path: PathBuf::from("/bin/busybox"),
        }
    }
}

/// Configuration for the bonding client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address the first request is sent to
    pub haap_anycast_ip: Ipv6Addr,

    /// Cellular interface, or a literal IPv6 address to use as its endpoint
    pub lte_interface: String,

    /// Broadband interface, or a literal IPv6 address
    pub dsl_interface: String,

    /// Bring up the DSL tunnel after LTE is established
    pub bonding: bool,

    /// Name of the local tunnel device
    pub tunnel_interface_name: String,

    /// Tunnel device MTU; derived from `bonding` when unset
    pub tunnel_interface_mtu: Option<u16>,

    /// Hello interval in seconds. 0 adopts the value pushed by the server.
    pub active_hello_interval: u32,

    /// Missed hellos before a link is considered dead. 0 adopts the server value.
    pub hello_retry_times: u32,

    /// Sent in the LTE request, zero padded to 40 bytes
    pub client_identification: String,

    /// Script invoked on lifecycle events
    pub event_script_path: Option<PathBuf>,

    /// error, warn, info, debug or trace
    pub log_level: String,

    /// Rate reported in bypass traffic notifications
    pub bypass_traffic_rate_kbit: u32,

    /// Control loop period
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    pub reorder: ReorderPolicy,

    pub dhcp: DhcpConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            haap_anycast_ip: Ipv6Addr::new(0x2003, 6, 0, 0, 0, 0, 0, 1),
            lte_interface: "wwan0".to_string(),
            dsl_interface: "ppp0".to_string(),
            bonding: false,
            tunnel_interface_name: "hybrid0".to_string(),
            tunnel_interface_mtu: None,
            active_hello_interval: 0,
            hello_retry_times: 0,
            client_identification: "grecp-client".to_string(),
            event_script_path: None,
            log_level: "info".to_string(),
            bypass_traffic_rate_kbit: 10_000,
            tick_interval: Duration::from_secs(1),
            reorder: ReorderPolicy::default(),
            dhcp: DhcpConfig::default(),
        }
    }
}

impl ClientConfig {
    /// MTU of the tunnel device
    pub fn effective_mtu(&self) -> u16 {
        self.tunnel_interface_mtu.unwrap_or(if self.bonding {
            MAX_TUNNEL_MTU - PPPOE_OVERHEAD
        } else {
            MAX_TUNNEL_MTU
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mtu) = self.tunnel_interface_mtu {
            if !(MIN_TUNNEL_MTU..=MAX_TUNNEL_MTU).contains(&mtu) {
                return Err(ConfigError::MtuOutOfRange(mtu));
            }
        }

        if self.client_identification.len() > CLIENT_IDENTIFICATION_LEN {
            return Err(ConfigError::ClientIdentificationTooLong(
                self.client_identification.len(),
            ));
        }

        for name in [
            &self.lte_interface,
            &self.dsl_interface,
            &self.tunnel_interface_name,
        ] {
            if name.is_empty() {
                return Err(ConfigError::EmptyInterfaceName);
            }
            // Literal addresses are longer than an interface name may be
            if name.len() > MAX_INTERFACE_NAME_LEN && name.parse::<Ipv6Addr>().is_err() {
                return Err(ConfigError::InterfaceNameTooLong(name.clone()));
            }
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }

        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::UnknownLogLevel(other.to_string())),
        }
    }
}
