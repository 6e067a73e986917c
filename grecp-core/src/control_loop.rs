//! Periodic control loop.
//!
//! `Controller` owns the `SystemState` together with every collaborator that
//! acts on it: the link sockets, the tunnel device lifecycle, the DHCP
//! helpers and the event notifier. Control packets are applied as they
//! arrive through [`Controller::handle_packet`]; everything else happens in
//! [`Controller::tick`], which the runtime calls once per tick interval.
//!
//! All times are uptimes. Using the same clock for both entry points keeps
//! hello timestamps comparable with their echoes.

use crate::config::ClientConfig;
use crate::dhcp::{parse_lease_output, Family, LeaseHelper};
use crate::event::{Event, EventNotifier};
use crate::handlers::{self, hex_dump, process_message};
use crate::proto::{GrecpMessage, HelloTimestamp, MessageType, TunnelType};
use crate::session::{Lease, LinkState, LinkView, SystemState};
use crate::transport::NetworkDevice;
use crate::tun::{TunnelLifecycle, TunnelParams};
use std::net::Ipv6Addr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

/// Socket and local endpoint of one link
#[derive(Clone)]
pub struct LinkEndpoint {
    pub device: Arc<dyn NetworkDevice>,
    pub local: Ipv6Addr,
}

impl LinkEndpoint {
    pub fn new(device: Arc<dyn NetworkDevice>, local: Ipv6Addr) -> Self {
        Self { device, local }
    }
}

/// Drives the GRECP state machine
pub struct Controller {
    state: SystemState,
    lte: LinkEndpoint,
    dsl: Option<LinkEndpoint>,
    tunnel: Box<dyn TunnelLifecycle>,
    dhcp4: Option<Box<dyn LeaseHelper>>,
    dhcp6: Option<Box<dyn LeaseHelper>>,
    events: Box<dyn EventNotifier>,
    client_identification: String,
    bypass_traffic_rate_kbit: u32,
}

impl Controller {
    pub fn new(
        cfg: &ClientConfig,
        lte: LinkEndpoint,
        dsl: Option<LinkEndpoint>,
        tunnel: Box<dyn TunnelLifecycle>,
        events: Box<dyn EventNotifier>,
    ) -> Self {
        let mut state = SystemState::from_config(cfg);
        state.lte.interface_ip = lte.local;
        if let Some(dsl) = &dsl {
            state.dsl.interface_ip = dsl.local;
        }

        Self {
            state,
            lte,
            dsl,
            tunnel,
            dhcp4: None,
            dhcp6: None,
            events,
            client_identification: cfg.client_identification.clone(),
            bypass_traffic_rate_kbit: cfg.bypass_traffic_rate_kbit,
        }
    }

    /// Attach a DHCP helper for its address family
    pub fn with_dhcp(mut self, helper: Box<dyn LeaseHelper>) -> Self {
        match helper.family() {
            Family::Ipv4 => self.dhcp4 = Some(helper),
            Family::Ipv6 => self.dhcp6 = Some(helper),
        }
        self
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn view(&self) -> LinkView {
        self.state.view()
    }

    pub fn request_shutdown(&mut self) {
        self.state.shutdown_requested = true;
    }

    pub fn startup(&mut self) {
        self.fire(Event::Startup);
    }

    /// Apply a control packet received from `source`
    pub fn handle_packet(
        &mut self,
        packet: &[u8],
        source: Ipv6Addr,
        now: Duration,
    ) -> Option<MessageType> {
        if source != self.state.session.haap_ip {
            tracing::trace!("Ignoring control packet from unexpected source {source}");
            return None;
        }
        process_message(&mut self.state, packet, now).ok()
    }

    /// Run one control loop iteration.
    ///
    /// Returns `Break` once a requested shutdown has completed.
    pub fn tick(&mut self, now: Duration) -> ControlFlow<()> {
        self.forget_down_links();
        self.send_request();
        self.acknowledge_filter_list();
        self.verify_tunnel();
        self.send_hellos(now);
        self.demote_silent_links();
        self.notify_bypass_traffic(now);
        if !self.state.any_established() {
            self.reset_session();
        }
        self.update_tunnel_device();
        self.poll_dhcp(now);
        self.expire_leases(now);

        if self.state.shutdown_requested {
            self.shutdown();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn endpoint(&self, tunnel: TunnelType) -> Option<&LinkEndpoint> {
        match tunnel {
            TunnelType::Lte => Some(&self.lte),
            TunnelType::Dsl => self.dsl.as_ref(),
        }
    }

    /// Encode and send a control message to the HAAP
    fn send(&self, message: &GrecpMessage) -> bool {
        let Some(endpoint) = self.endpoint(message.tunnel_type) else {
            tracing::error!("No socket for {} tunnel", message.tunnel_type);
            return false;
        };

        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Encoding {} message failed: {e}", message.message_type);
                return false;
            }
        };

        match endpoint.device.send(&bytes, self.state.session.haap_ip) {
            Ok(()) => {
                tracing::debug!(
                    "Sent {} message on {} tunnel",
                    message.message_type,
                    message.tunnel_type
                );
                tracing::trace!("Contents of {} message: {}", message.message_type, hex_dump(&bytes));
                true
            }
            Err(e) => {
                tracing::error!(
                    "Sending {} message on {} tunnel failed: {e}",
                    message.message_type,
                    message.tunnel_type
                );
                false
            }
        }
    }

    fn fire(&mut self, event: Event) {
        let env = self.state.event_env();
        self.events.notify(event, &env);
    }

    /// Clear bookkeeping of links that went down since the last tick
    fn forget_down_links(&mut self) {
        for tunnel in TunnelType::ALL {
            let link = self.state.link_mut(tunnel);
            if link.state == LinkState::Down && !link.is_pristine() {
                link.reset();
            }
        }
    }

    /// One request per tick. DSL waits for LTE.
    fn send_request(&mut self) {
        let tunnel = if !self.state.lte.is_established() {
            TunnelType::Lte
        } else if self.state.bonding && !self.state.dsl.is_established() {
            TunnelType::Dsl
        } else {
            return;
        };

        let message = handlers::request(&self.state.session, tunnel, &self.client_identification);
        if self.send(&message) {
            self.state.link_mut(tunnel).state = LinkState::Requesting;
        }
    }

    fn acknowledge_filter_list(&mut self) {
        let session = &self.state.session;
        if !self.state.lte.is_established()
            || session.filter_list_commit_count == 0
            || session.filter_list_acked
        {
            return;
        }
        let message = handlers::filter_list_ack(session);
        self.state.session.filter_list_acked = self.send(&message);
    }

    fn verify_tunnel(&mut self) {
        if !self.state.lte.is_established() || !self.state.lte.tunnel_verification_required {
            return;
        }
        let message = handlers::tunnel_verification(&self.state.session);
        if self.send(&message) {
            self.state.lte.tunnel_verification_required = false;
        }
    }

    fn send_hellos(&mut self, now: Duration) {
        let interval = self.state.session.hello_interval();
        let stamp = HelloTimestamp::from_uptime(now);

        for tunnel in TunnelType::ALL {
            let link = self.state.link_mut(tunnel);
            if !link.is_established() || now.saturating_sub(link.last_hello_sent) < interval {
                continue;
            }
            if link.last_hello_received != link.last_hello_sent {
                link.missed_hellos += 1;
                tracing::warn!(
                    "No reply to last hello on {} tunnel ({} missed)",
                    tunnel,
                    link.missed_hellos
                );
            }
            // Counted as sent even if the send fails
            link.last_hello_sent = stamp.as_duration();

            let message = handlers::hello(&self.state.session, tunnel, stamp);
            self.send(&message);
        }
    }

    fn demote_silent_links(&mut self) {
        let limit = self.state.session.retry_limit();
        for tunnel in TunnelType::ALL {
            let link = self.state.link_mut(tunnel);
            if link.is_established() && link.missed_hellos >= limit {
                tracing::error!(
                    "Maximum allowed number of missed hello messages reached, considering {} tunnel dead",
                    tunnel
                );
                link.reset();
            }
        }
    }

    fn notify_bypass_traffic(&mut self, now: Duration) {
        let interval = self.state.session.bypass_interval();
        let dsl = &self.state.dsl;
        if !dsl.is_established() || now.saturating_sub(dsl.last_bypass_traffic_sent) <= interval {
            return;
        }
        let message = handlers::bypass_traffic(&self.state.session, self.bypass_traffic_rate_kbit);
        self.send(&message);
        self.state.dsl.last_bypass_traffic_sent = now;
    }

    /// Both links are down: start over
    fn reset_session(&mut self) {
        self.state.session.reset();
        self.release_leases();
    }

    /// Stop the helpers and drop any lease, announcing each one lost
    fn release_leases(&mut self) {
        for helper in [&mut self.dhcp4, &mut self.dhcp6].into_iter().flatten() {
            helper.kill();
        }
        if self.state.dhcp4.is_some() {
            self.fire(Event::DhcpDownIp);
            self.state.dhcp4 = None;
        }
        if self.state.dhcp6.is_some() {
            self.fire(Event::DhcpDownIp6);
            self.state.dhcp6 = None;
        }
    }

    fn update_tunnel_device(&mut self) {
        let any_up = self.state.any_established();
        if any_up && !self.state.tunnel_interface_created {
            let params = TunnelParams {
                name: self.state.tunnel_interface_name.clone(),
                mtu: self.state.tunnel_interface_mtu,
            };
            match self.tunnel.create(&params) {
                Ok(()) => {
                    self.state.tunnel_interface_created = true;
                    self.fire(Event::TunnelUp);
                }
                Err(e) => tracing::error!("Creating tunnel interface '{}' failed: {e}", params.name),
            }
        } else if !any_up && self.state.tunnel_interface_created {
            self.destroy_tunnel_device();
        }
    }

    fn destroy_tunnel_device(&mut self) {
        if let Err(e) = self.tunnel.destroy() {
            tracing::error!(
                "Destroying tunnel interface '{}' failed: {e}",
                self.state.tunnel_interface_name
            );
        }
        self.state.tunnel_interface_created = false;
        self.fire(Event::TunnelDown);
    }

    fn poll_dhcp(&mut self, now: Duration) {
        for family in [Family::Ipv4, Family::Ipv6] {
            let has_lease = match family {
                Family::Ipv4 => self.state.dhcp4.is_some(),
                Family::Ipv6 => self.state.dhcp6.is_some(),
            };
            let created = self.state.tunnel_interface_created;
            let interface = self.state.tunnel_interface_name.clone();

            let helper = match family {
                Family::Ipv4 => self.dhcp4.as_mut(),
                Family::Ipv6 => self.dhcp6.as_mut(),
            };
            let Some(helper) = helper else {
                continue;
            };

            if !helper.is_running() {
                if created && !has_lease {
                    if let Err(e) = helper.start(&interface) {
                        tracing::error!("{e}");
                    }
                }
                continue;
            }

            match helper.poll() {
                None => {}
                Some(Err(e)) => tracing::error!("{e}"),
                Some(Ok(output)) => self.apply_lease_output(family, &output, now),
            }
        }
    }

    fn apply_lease_output(&mut self, family: Family, output: &str, now: Duration) {
        let parsed = parse_lease_output(output);
        match family {
            Family::Ipv4 => match parsed.into_dhcp4(now) {
                Some(lease) => {
                    tracing::info!(
                        "Obtained lease for {} via {} ({}s)",
                        lease.ip,
                        family.applet(),
                        lease.lease_time.as_secs()
                    );
                    self.state.dhcp4 = Some(lease);
                    self.fire(Event::DhcpUpIp);
                }
                None => tracing::warn!("{} exited without a usable lease", family.applet()),
            },
            Family::Ipv6 => match parsed.into_dhcp6(now) {
                Some(lease) => {
                    tracing::info!(
                        "Obtained lease for {}/{} via {} ({}s)",
                        lease.prefix_address,
                        lease.prefix_length,
                        family.applet(),
                        lease.lease_time.as_secs()
                    );
                    self.state.dhcp6 = Some(lease);
                    self.fire(Event::DhcpUpIp6);
                }
                None => tracing::warn!("{} exited without a usable lease", family.applet()),
            },
        }
    }

    fn expire_leases(&mut self, now: Duration) {
        if let Some(lease) = self.state.dhcp4.filter(|l| l.is_expired(now)) {
            tracing::info!("Lease for {} expired", lease.ip);
            self.fire(Event::DhcpDownIp);
            self.state.dhcp4 = None;
        }
        if let Some(lease) = self.state.dhcp6.filter(|l| l.is_expired(now)) {
            tracing::info!(
                "Lease for {}/{} expired",
                lease.prefix_address,
                lease.prefix_length
            );
            self.fire(Event::DhcpDownIp6);
            self.state.dhcp6 = None;
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        self.release_leases();

        if self.state.tunnel_interface_created {
            self.destroy_tunnel_device();
        }

        // There is no disconnect message. Reporting a link failure on
        // both tunnels only works while both are up.
        if self.state.all_established() {
            for tunnel in TunnelType::ALL {
                let message = handlers::link_failure(&self.state.session, tunnel);
                self.send(&message);
            }
        } else if self.state.any_established() {
            tracing::warn!(
                "Session stays active on the HAAP until it times out; reconnecting may fail until then"
            );
        }

        self.fire(Event::Shutdown);
    }
}
