use grecp_core::bridge::{Decapsulator, Encapsulator};
use grecp_core::config::ClientConfig;
use grecp_core::control_loop::{Controller, LinkEndpoint};
use grecp_core::dhcp::{DhcpError, Family, LeaseHelper};
use grecp_core::event::{Event, EventNotifier};
use grecp_core::proto::{
    attr, Attribute, GreHeader, GrecpMessage, MessageType, TunnelType, ETHERTYPE_IPV4,
};
use grecp_core::reorder::ReorderPolicy;
use grecp_core::session::LinkState;
use grecp_core::transport::NetworkDevice;
use grecp_core::tun::{frame, TunnelLifecycle, TunnelParams};
use std::io;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const KEY: u32 = 0x1234_5678;

fn haap() -> Ipv6Addr {
    "2003:6:2::9".parse().unwrap()
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Records everything sent and plays the HAAP's side on demand
#[derive(Default)]
struct FakeLink {
    sent: Mutex<Vec<(Vec<u8>, Ipv6Addr)>>,
}

impl FakeLink {
    fn drain(&self) -> Vec<GrecpMessage> {
        self.sent
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|(bytes, _)| GrecpMessage::decode(&bytes).ok())
            .collect()
    }

    fn last_destination(&self) -> Option<Ipv6Addr> {
        self.sent.lock().unwrap().last().map(|(_, dst)| *dst)
    }
}

impl NetworkDevice for FakeLink {
    fn send(&self, packet: &[u8], destination: Ipv6Addr) -> io::Result<()> {
        self.sent.lock().unwrap().push((packet.to_vec(), destination));
        Ok(())
    }

    fn receive(&self, _buf: &mut [u8]) -> io::Result<Option<(usize, Ipv6Addr)>> {
        Ok(None)
    }
}

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }
}

struct FakeTunnel(Journal);

impl TunnelLifecycle for FakeTunnel {
    fn create(&mut self, params: &TunnelParams) -> io::Result<()> {
        self.0.push(format!("create {} {}", params.name, params.mtu));
        Ok(())
    }

    fn destroy(&mut self) -> io::Result<()> {
        self.0.push("destroy");
        Ok(())
    }
}

struct FakeEvents(Journal);

impl EventNotifier for FakeEvents {
    fn notify(&mut self, event: Event, env: &[(String, String)]) {
        let ip = env
            .iter()
            .find(|(k, _)| k == "dhcp_ip")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        self.0.push(format!("{event} {ip}"));
    }
}

/// Hands out one lease per start
struct FakeUdhcpc {
    journal: Journal,
    running: bool,
}

impl LeaseHelper for FakeUdhcpc {
    fn family(&self) -> Family {
        Family::Ipv4
    }

    fn start(&mut self, interface: &str) -> Result<(), DhcpError> {
        self.journal.push(format!("udhcpc {interface}"));
        self.running = true;
        Ok(())
    }

    fn poll(&mut self) -> Option<Result<String, DhcpError>> {
        if !self.running {
            return None;
        }
        self.running = false;
        Some(Ok("ip=100.64.0.2\nlease=3600\nsome other line\n".to_string()))
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn kill(&mut self) {
        if self.running {
            self.journal.push("udhcpc killed");
        }
        self.running = false;
    }
}

struct Client {
    controller: Controller,
    lte: Arc<FakeLink>,
    dsl: Arc<FakeLink>,
    tunnel: Journal,
    events: Journal,
    dhcp: Journal,
}

fn client() -> Client {
    let cfg = ClientConfig {
        bonding: true,
        hello_retry_times: 3,
        client_identification: "test-cpe".to_string(),
        ..ClientConfig::default()
    };
    let lte = Arc::new(FakeLink::default());
    let dsl = Arc::new(FakeLink::default());
    let tunnel = Journal::default();
    let events = Journal::default();
    let dhcp = Journal::default();

    let controller = Controller::new(
        &cfg,
        LinkEndpoint::new(lte.clone(), "2001:db8:a::1".parse().unwrap()),
        Some(LinkEndpoint::new(dsl.clone(), "2001:db8:b::1".parse().unwrap())),
        Box::new(FakeTunnel(tunnel.clone())),
        Box::new(FakeEvents(events.clone())),
    )
    .with_dhcp(Box::new(FakeUdhcpc {
        journal: dhcp.clone(),
        running: false,
    }));

    Client {
        controller,
        lte,
        dsl,
        tunnel,
        events,
        dhcp,
    }
}

fn accept(tunnel: TunnelType) -> Vec<u8> {
    GrecpMessage::new(MessageType::Accept, tunnel, 0)
        .with_attribute(Attribute::new(attr::H_IPV6_ADDRESS, haap().octets().to_vec()))
        .with_attribute(Attribute::from_u32(attr::SESSION_ID, 7))
        .with_attribute(Attribute::from_u32(attr::BONDING_KEY_VALUE, KEY))
        .with_attribute(Attribute::from_u32(attr::ACTIVE_HELLO_INTERVAL, 1))
        .with_attribute(Attribute::from_u32(attr::HELLO_RETRY_TIMES, 10))
        .with_attribute(Attribute::from_u32(attr::BYPASS_BANDWIDTH_CHECK_INTERVAL, 2))
        .with_attribute(Attribute::padding())
        .encode()
        .unwrap()
}

/// Echo every hello back, as the HAAP does
fn echo_hellos(client: &mut Client, link: &FakeLink, now: Duration) {
    for message in link.drain() {
        if message.message_type == MessageType::Hello {
            let reply = message.encode().unwrap();
            client.controller.handle_packet(&reply, haap(), now);
        }
    }
}

#[test]
fn test_full_session_lifecycle() {
    let mut c = client();
    let anycast = ClientConfig::default().haap_anycast_ip;

    c.controller.startup();
    assert_eq!(c.events.take(), vec!["startup 0.0.0.0".to_string()]);

    // LTE comes up first
    c.controller.tick(secs(1));
    assert_eq!(c.lte.last_destination(), Some(anycast));
    let request = c.lte.drain();
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].message_type, MessageType::Request);
    let name = request[0].attribute(attr::CLIENT_IDENTIFICATION_NAME).unwrap();
    assert_eq!(name.value.len(), 40);
    assert!(name.value.starts_with(b"test-cpe"));
    assert_eq!(c.controller.state().lte.state, LinkState::Requesting);

    assert_eq!(
        c.controller
            .handle_packet(&accept(TunnelType::Lte), anycast, secs(1)),
        Some(MessageType::Accept)
    );
    let session = &c.controller.state().session;
    assert_eq!(session.haap_ip, haap());
    assert_eq!(session.bonding_key, KEY);
    // Locally configured retry limit wins, the interval is adopted
    assert_eq!(session.hello_retry_times, 3);
    assert_eq!(session.active_hello_interval, 1);

    // Tunnel device, DSL request and DHCP start in one tick
    c.controller.tick(secs(2));
    assert_eq!(c.tunnel.take(), vec!["create hybrid0 1440".to_string()]);
    assert_eq!(c.events.take(), vec!["tunnelup 0.0.0.0".to_string()]);
    assert_eq!(c.dhcp.take(), vec!["udhcpc hybrid0".to_string()]);
    assert_eq!(c.dsl.last_destination(), Some(haap()));
    let dsl = c.dsl.drain();
    assert_eq!(dsl.len(), 1);
    assert_eq!(dsl[0].message_type, MessageType::Request);
    assert!(dsl[0].attribute(attr::CLIENT_IDENTIFICATION_NAME).is_none());
    assert_eq!(dsl[0].attribute(attr::SESSION_ID).unwrap().as_u32(), Some(7));
    let lte = c.lte.clone();
    echo_hellos(&mut c, &lte, secs(2));

    c.controller.handle_packet(&accept(TunnelType::Dsl), haap(), secs(2));
    assert!(c.controller.state().all_established());

    // Lease arrives
    c.controller.tick(secs(3));
    let lease = c.controller.state().dhcp4.unwrap();
    assert_eq!(lease.ip.to_string(), "100.64.0.2");
    assert_eq!(c.events.take(), vec!["dhcpup_ip 100.64.0.2".to_string()]);
    let bypass: Vec<_> = c
        .dsl
        .drain()
        .into_iter()
        .filter(|m| m.attribute(attr::BYPASS_TRAFFIC_RATE).is_some())
        .collect();
    assert_eq!(bypass.len(), 1);

    // Healthy hellos keep both links up
    for t in 4..10 {
        c.controller.tick(secs(t));
        let lte = c.lte.clone();
        let dsl = c.dsl.clone();
        echo_hellos(&mut c, &lte, secs(t));
        echo_hellos(&mut c, &dsl, secs(t));
    }
    assert!(c.controller.state().all_established());
    assert_eq!(c.controller.state().dsl.missed_hellos, 0);

    // DSL goes silent; LTE still answers
    for t in 10..14 {
        c.controller.tick(secs(t));
        let lte = c.lte.clone();
        echo_hellos(&mut c, &lte, secs(t));
        c.dsl.drain();
    }
    let state = c.controller.state();
    assert!(state.lte.is_established());
    assert!(!state.dsl.is_established());
    assert!(state.dsl.is_pristine());
    assert_eq!(state.session.bonding_key, KEY);
    assert!(state.tunnel_interface_created);

    // DSL is requested again on the next tick
    c.controller.tick(secs(14));
    let dsl = c.dsl.drain();
    assert_eq!(dsl[0].message_type, MessageType::Request);

    // Teardown drops everything
    let teardown = GrecpMessage::new(MessageType::Teardown, TunnelType::Lte, KEY)
        .with_attribute(Attribute::from_u32(attr::ERROR_CODE, 1))
        .encode()
        .unwrap();
    assert_eq!(
        c.controller.handle_packet(&teardown, haap(), secs(14)),
        Some(MessageType::Teardown)
    );
    c.controller.tick(secs(15));

    let state = c.controller.state();
    assert!(!state.any_established());
    assert_eq!(state.session.bonding_key, 0);
    assert_eq!(state.session.session_id, 0);
    assert_eq!(state.session.filter_list_commit_count, 0);
    assert_eq!(state.session.haap_ip, anycast);
    assert!(state.dhcp4.is_none());
    assert!(!state.tunnel_interface_created);
    assert_eq!(
        c.events.take(),
        vec!["dhcpdown_ip 100.64.0.2".to_string(), "tunneldown 0.0.0.0".to_string()]
    );
    assert_eq!(c.tunnel.take(), vec!["destroy".to_string()]);

    // Shutdown with nothing up only fires the event
    c.lte.drain();
    c.controller.request_shutdown();
    assert!(c.controller.tick(secs(16)).is_break());
    assert_eq!(c.events.take(), vec!["shutdown 0.0.0.0".to_string()]);
}

#[test]
fn test_wrong_key_and_source_are_ignored() {
    let mut c = client();
    let anycast = ClientConfig::default().haap_anycast_ip;
    c.controller.tick(secs(1));
    c.controller.handle_packet(&accept(TunnelType::Lte), anycast, secs(1));

    let forged = GrecpMessage::new(MessageType::Teardown, TunnelType::Lte, KEY ^ 1)
        .encode()
        .unwrap();
    assert_eq!(c.controller.handle_packet(&forged, haap(), secs(2)), None);

    let stray = GrecpMessage::new(MessageType::Teardown, TunnelType::Lte, KEY)
        .encode()
        .unwrap();
    assert_eq!(c.controller.handle_packet(&stray, anycast, secs(2)), None);

    let garbage = [0x20, 0x00, 0x01, 0x01, 0x00];
    assert_eq!(c.controller.handle_packet(&garbage, haap(), secs(2)), None);

    assert!(c.controller.state().lte.is_established());
}

#[test]
fn test_data_plane_follows_control_state() {
    let mut c = client();
    let anycast = ClientConfig::default().haap_anycast_ip;
    let mut encapsulator = Encapsulator::new();
    let mut decapsulator = Decapsulator::new(ReorderPolicy::Fixed {
        timeout: Duration::from_millis(50),
    });

    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[9] = 6;
    let outbound = frame(ETHERTYPE_IPV4, &packet);

    // Nothing is up yet
    assert!(encapsulator.encapsulate(&outbound, &c.controller.view()).is_none());

    c.controller.tick(secs(1));
    c.controller.handle_packet(&accept(TunnelType::Lte), anycast, secs(1));
    let view = c.controller.view();

    let (tunnel, gre) = encapsulator.encapsulate(&outbound, &view).unwrap();
    assert_eq!(tunnel, TunnelType::Lte);
    let (header, offset) = GreHeader::decode(&gre).unwrap();
    assert_eq!(header.key, KEY);
    assert_eq!(header.sequence, Some(0));
    assert_eq!(&gre[offset..], &packet[..]);

    // Downstream packets arrive out of order
    let start = Instant::now();
    let downstream = |sequence: u32| {
        let mut bytes = GreHeader::new(ETHERTYPE_IPV4, KEY, Some(sequence)).encode();
        bytes.extend_from_slice(&packet);
        let last = bytes.len() - 1;
        bytes[last] = sequence as u8;
        bytes
    };
    assert!(decapsulator.on_packet(&downstream(2), &view, start).is_empty());
    let released = decapsulator.on_packet(&downstream(1), &view, start);
    let markers: Vec<u8> = released.iter().map(|f| *f.last().unwrap()).collect();
    assert_eq!(markers, vec![1, 2]);

    // A gap is skipped once the timeout passes
    assert!(decapsulator.on_packet(&downstream(4), &view, start).is_empty());
    let released = decapsulator.on_tick(&view, start + Duration::from_millis(60));
    assert_eq!(released.len(), 1);
    assert_eq!(*released[0].last().unwrap(), 4);
    assert!(decapsulator
        .on_packet(&downstream(3), &view, start + Duration::from_millis(70))
        .is_empty());
}
