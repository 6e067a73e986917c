//! Session and link state.
//!
//! `SystemState` is owned by the control loop. Message handlers and timers
//! receive it by `&mut`; the data plane only ever sees a `LinkView` copy.
//!
//! Timestamps are uptimes (`Duration` since the process clock origin) so
//! they compare directly with the values echoed back in hello messages.

use crate::config::ClientConfig;
use crate::proto::TunnelType;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Retry limit used when neither the operator nor the server set one
pub const DEFAULT_HELLO_RETRY_TIMES: u32 = 3;

/// Hello interval used when neither the operator nor the server set one
pub const DEFAULT_ACTIVE_HELLO_INTERVAL: u32 = 5;

/// Connection state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Down,
    /// Request sent, no answer yet
    Requesting,
    Established,
}

/// One access link and its tunnel
#[derive(Debug, Clone)]
pub struct Link {
    pub tunnel: TunnelType,
    pub interface_name: String,
    /// Local tunnel endpoint
    pub interface_ip: Ipv6Addr,
    pub state: LinkState,
    pub last_hello_sent: Duration,
    pub last_hello_received: Duration,
    pub missed_hellos: u32,
    pub round_trip_time: Duration,
    /// Server asked for a tunnel verification notify
    pub tunnel_verification_required: bool,
    pub last_bypass_traffic_sent: Duration,
}

impl Link {
    pub fn new(tunnel: TunnelType, interface_name: impl Into<String>) -> Self {
        Self {
            tunnel,
            interface_name: interface_name.into(),
            interface_ip: Ipv6Addr::UNSPECIFIED,
            state: LinkState::Down,
            last_hello_sent: Duration::ZERO,
            last_hello_received: Duration::ZERO,
            missed_hellos: 0,
            round_trip_time: Duration::ZERO,
            tunnel_verification_required: false,
            last_bypass_traffic_sent: Duration::ZERO,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == LinkState::Established
    }

    /// Establish the link with a fresh liveness window
    pub fn establish(&mut self, now: Duration) {
        self.state = LinkState::Established;
        self.missed_hellos = 0;
        self.last_hello_sent = now;
        self.last_hello_received = now;
    }

    /// Forget hello and verification bookkeeping. Address and name stay.
    pub fn reset(&mut self) {
        self.state = LinkState::Down;
        self.last_hello_sent = Duration::ZERO;
        self.last_hello_received = Duration::ZERO;
        self.missed_hellos = 0;
        self.round_trip_time = Duration::ZERO;
        self.tunnel_verification_required = false;
        self.last_bypass_traffic_sent = Duration::ZERO;
    }

    /// Bookkeeping is at its reset values
    pub fn is_pristine(&self) -> bool {
        self.last_hello_sent.is_zero()
            && self.last_hello_received.is_zero()
            && self.missed_hellos == 0
            && self.round_trip_time.is_zero()
            && !self.tunnel_verification_required
            && self.last_bypass_traffic_sent.is_zero()
    }
}

/// State shared by both links, mostly assigned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub anycast_ip: Ipv6Addr,
    /// Where control and data packets go; the anycast address until accepted
    pub haap_ip: Ipv6Addr,
    pub session_id: u32,
    pub bonding_key: u32,
    /// Seconds between hellos, 0 until known
    pub active_hello_interval: u32,
    pub hello_retry_times: u32,
    /// Seconds between bypass traffic notifications
    pub bypass_bandwidth_check_interval: u32,
    pub filter_list_commit_count: u32,
    pub filter_list_acked: bool,
    configured_hello_interval: u32,
    configured_retry_times: u32,
}

impl Session {
    pub fn new(anycast_ip: Ipv6Addr, hello_interval: u32, retry_times: u32) -> Self {
        Self {
            anycast_ip,
            haap_ip: anycast_ip,
            session_id: 0,
            bonding_key: 0,
            active_hello_interval: hello_interval,
            hello_retry_times: retry_times,
            bypass_bandwidth_check_interval: 0,
            filter_list_commit_count: 0,
            filter_list_acked: false,
            configured_hello_interval: hello_interval,
            configured_retry_times: retry_times,
        }
    }

    /// Back to startup values, keeping operator-configured hello settings
    pub fn reset(&mut self) {
        *self = Self::new(
            self.anycast_ip,
            self.configured_hello_interval,
            self.configured_retry_times,
        );
    }

    pub fn hello_interval(&self) -> Duration {
        let secs = match self.active_hello_interval {
            0 => DEFAULT_ACTIVE_HELLO_INTERVAL,
            secs => secs,
        };
        Duration::from_secs(u64::from(secs))
    }

    /// Effective retry limit; 0 would drop a link on the first hello
    pub fn retry_limit(&self) -> u32 {
        match self.hello_retry_times {
            0 => DEFAULT_HELLO_RETRY_TIMES,
            n => n,
        }
    }

    pub fn bypass_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.bypass_bandwidth_check_interval))
    }
}

/// IPv4 address obtained through DHCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dhcp4Lease {
    pub ip: Ipv4Addr,
    pub lease_time: Duration,
    pub obtained: Duration,
}

/// IPv6 prefix obtained through DHCPv6 prefix delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dhcp6Lease {
    pub prefix_address: Ipv6Addr,
    pub prefix_length: u8,
    pub lease_time: Duration,
    pub obtained: Duration,
}

/// A lease that runs out at `obtained + lease_time`
pub trait Lease {
    fn expires_at(&self) -> Duration;

    fn is_expired(&self, now: Duration) -> bool {
        self.expires_at() <= now
    }
}

impl Lease for Dhcp4Lease {
    fn expires_at(&self) -> Duration {
        self.obtained + self.lease_time
    }
}

impl Lease for Dhcp6Lease {
    fn expires_at(&self) -> Duration {
        self.obtained + self.lease_time
    }
}

/// Everything the client knows at runtime
#[derive(Debug, Clone)]
pub struct SystemState {
    pub lte: Link,
    pub dsl: Link,
    pub session: Session,
    pub bonding: bool,
    pub tunnel_interface_name: String,
    pub tunnel_interface_mtu: u16,
    pub tunnel_interface_created: bool,
    pub dhcp4: Option<Dhcp4Lease>,
    pub dhcp6: Option<Dhcp6Lease>,
    pub shutdown_requested: bool,
}

impl SystemState {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            lte: Link::new(TunnelType::Lte, cfg.lte_interface.clone()),
            dsl: Link::new(TunnelType::Dsl, cfg.dsl_interface.clone()),
            session: Session::new(
                cfg.haap_anycast_ip,
                cfg.active_hello_interval,
                cfg.hello_retry_times,
            ),
            bonding: cfg.bonding,
            tunnel_interface_name: cfg.tunnel_interface_name.clone(),
            tunnel_interface_mtu: cfg.effective_mtu(),
            tunnel_interface_created: false,
            dhcp4: None,
            dhcp6: None,
            shutdown_requested: false,
        }
    }

    pub fn link(&self, tunnel: TunnelType) -> &Link {
        match tunnel {
            TunnelType::Lte => &self.lte,
            TunnelType::Dsl => &self.dsl,
        }
    }

    pub fn link_mut(&mut self, tunnel: TunnelType) -> &mut Link {
        match tunnel {
            TunnelType::Lte => &mut self.lte,
            TunnelType::Dsl => &mut self.dsl,
        }
    }

    pub fn any_established(&self) -> bool {
        self.lte.is_established() || self.dsl.is_established()
    }

    pub fn all_established(&self) -> bool {
        self.lte.is_established() && self.dsl.is_established()
    }

    /// Read-only snapshot for the data plane
    pub fn view(&self) -> LinkView {
        LinkView {
            haap_ip: self.session.haap_ip,
            bonding_key: self.session.bonding_key,
            lte_established: self.lte.is_established(),
            dsl_established: self.dsl.is_established(),
            lte_rtt: self.lte.round_trip_time,
            dsl_rtt: self.dsl.round_trip_time,
        }
    }

    /// Environment handed to the event script
    pub fn event_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("lte_interface_name".to_string(), self.lte.interface_name.clone())];
        if self.bonding {
            env.push(("dsl_interface_name".to_string(), self.dsl.interface_name.clone()));
        }
        env.push((
            "tunnel_interface_name".to_string(),
            self.tunnel_interface_name.clone(),
        ));
        env.push((
            "tunnel_interface_mtu".to_string(),
            self.tunnel_interface_mtu.to_string(),
        ));

        let (ip, lease) = match &self.dhcp4 {
            Some(l) => (l.ip.to_string(), l.lease_time.as_secs().to_string()),
            None => (Ipv4Addr::UNSPECIFIED.to_string(), "0".to_string()),
        };
        env.push(("dhcp_ip".to_string(), ip));
        env.push(("dhcp_lease_time".to_string(), lease));

        let (prefix, length, lease) = match &self.dhcp6 {
            Some(l) => (
                l.prefix_address.to_string(),
                l.prefix_length.to_string(),
                l.lease_time.as_secs().to_string(),
            ),
            None => (Ipv6Addr::UNSPECIFIED.to_string(), "0".to_string(), "0".to_string()),
        };
        env.push(("dhcp6_prefix_address".to_string(), prefix));
        env.push(("dhcp6_prefix_length".to_string(), length));
        env.push(("dhcp6_lease_time".to_string(), lease));
        env
    }
}

/// What the data plane needs to know about the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkView {
    pub haap_ip: Ipv6Addr,
    pub bonding_key: u32,
    pub lte_established: bool,
    pub dsl_established: bool,
    pub lte_rtt: Duration,
    pub dsl_rtt: Duration,
}

impl LinkView {
    pub fn is_established(&self, tunnel: TunnelType) -> bool {
        match tunnel {
            TunnelType::Lte => self.lte_established,
            TunnelType::Dsl => self.dsl_established,
        }
    }

    pub fn any_established(&self) -> bool {
        self.lte_established || self.dsl_established
    }
}

impl Default for LinkView {
    fn default() -> Self {
        Self {
            haap_ip: Ipv6Addr::UNSPECIFIED,
            bonding_key: 0,
            lte_established: false,
            dsl_established: false,
            lte_rtt: Duration::ZERO,
            dsl_rtt: Duration::ZERO,
        }
    }
}
