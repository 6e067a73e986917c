//! Egress link selection.
//!
//! Every outgoing frame goes over exactly one link:
//!
//! - **DHCP** (client to server ports) always uses LTE without a sequence
//!   number, so address negotiation works before DSL is up.
//! - **Data** prefers DSL while it is established and falls back to LTE.
//!   Data is always sequenced so the server can reorder it.
//!
//! Selection is pure; the `Scheduler` only adds counters on top.

use crate::proto::{TunnelType, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::session::LinkView;

const IPPROTO_UDP: u8 = 17;
const DHCP4_CLIENT_PORT: u16 = 68;
const DHCP4_SERVER_PORT: u16 = 67;
const DHCP6_CLIENT_PORT: u16 = 546;
const DHCP6_SERVER_PORT: u16 = 547;
const IPV6_HEADER_LEN: usize = 40;

/// What kind of traffic a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    Dhcp,
    Data,
}

impl TrafficClass {
    /// Classify an IP packet by EtherType and contents
    pub fn of(ethertype: u16, packet: &[u8]) -> Self {
        let ports = match ethertype {
            ETHERTYPE_IPV4 => udp_ports_v4(packet),
            ETHERTYPE_IPV6 => udp_ports_v6(packet),
            _ => None,
        };
        match (ethertype, ports) {
            (ETHERTYPE_IPV4, Some((DHCP4_CLIENT_PORT, DHCP4_SERVER_PORT)))
            | (ETHERTYPE_IPV6, Some((DHCP6_CLIENT_PORT, DHCP6_SERVER_PORT))) => Self::Dhcp,
            _ => Self::Data,
        }
    }
}

fn read_ports(udp: &[u8]) -> Option<(u16, u16)> {
    let b = udp.get(0..4)?;
    Some((u16::from_be_bytes([b[0], b[1]]), u16::from_be_bytes([b[2], b[3]])))
}

fn udp_ports_v4(packet: &[u8]) -> Option<(u16, u16)> {
    let first = *packet.first()?;
    let header_len = usize::from(first & 0x0f) * 4;
    if *packet.get(9)? != IPPROTO_UDP {
        return None;
    }
    read_ports(packet.get(header_len..)?)
}

fn udp_ports_v6(packet: &[u8]) -> Option<(u16, u16)> {
    if *packet.get(6)? != IPPROTO_UDP {
        return None;
    }
    read_ports(packet.get(IPV6_HEADER_LEN..)?)
}

/// Scheduler decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerDecision {
    /// Link to send on
    pub tunnel: TunnelType,
    /// Attach the next sequence number
    pub sequenced: bool,
}

/// Pick the link for a frame; `None` when no link can carry it
pub fn schedule(class: TrafficClass, view: &LinkView) -> Option<SchedulerDecision> {
    match class {
        TrafficClass::Dhcp => Some(SchedulerDecision {
            tunnel: TunnelType::Lte,
            sequenced: false,
        }),
        TrafficClass::Data if view.dsl_established => Some(SchedulerDecision {
            tunnel: TunnelType::Dsl,
            sequenced: true,
        }),
        TrafficClass::Data if view.lte_established => Some(SchedulerDecision {
            tunnel: TunnelType::Lte,
            sequenced: true,
        }),
        TrafficClass::Data => None,
    }
}

/// Per-link egress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub lte_packets: u64,
    pub dsl_packets: u64,
    /// Frames dropped because every link was down
    pub unroutable: u64,
}

/// Packet scheduler
#[derive(Debug, Default)]
pub struct Scheduler {
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a link and count the decision
    pub fn schedule(&mut self, class: TrafficClass, view: &LinkView) -> Option<SchedulerDecision> {
        let decision = schedule(class, view);
        match decision.map(|d| d.tunnel) {
            Some(TunnelType::Lte) => self.stats.lte_packets += 1,
            Some(TunnelType::Dsl) => self.stats.dsl_packets += 1,
            None => self.stats.unroutable += 1,
        }
        decision
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(lte: bool, dsl: bool) -> LinkView {
        LinkView {
            lte_established: lte,
            dsl_established: dsl,
            ..Default::default()
        }
    }

    fn udp4(src: u16, dst: u16) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[9] = IPPROTO_UDP;
        packet[20..22].copy_from_slice(&src.to_be_bytes());
        packet[22..24].copy_from_slice(&dst.to_be_bytes());
        packet
    }

    fn udp6(src: u16, dst: u16) -> Vec<u8> {
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[6] = IPPROTO_UDP;
        packet[40..42].copy_from_slice(&src.to_be_bytes());
        packet[42..44].copy_from_slice(&dst.to_be_bytes());
        packet
    }

    #[test]
    fn test_dhcp_detection() {
        assert_eq!(TrafficClass::of(ETHERTYPE_IPV4, &udp4(68, 67)), TrafficClass::Dhcp);
        assert_eq!(TrafficClass::of(ETHERTYPE_IPV6, &udp6(546, 547)), TrafficClass::Dhcp);
        assert_eq!(TrafficClass::of(ETHERTYPE_IPV4, &udp4(67, 68)), TrafficClass::Data);
        assert_eq!(TrafficClass::of(ETHERTYPE_IPV6, &udp4(68, 67)), TrafficClass::Data);
        assert_eq!(TrafficClass::of(ETHERTYPE_IPV4, &[0x45]), TrafficClass::Data);
    }

    #[test]
    fn test_dhcp_honours_ipv4_options() {
        let mut packet = vec![0u8; 32];
        packet[0] = 0x46; // 24 byte header
        packet[9] = IPPROTO_UDP;
        packet[24..26].copy_from_slice(&68u16.to_be_bytes());
        packet[26..28].copy_from_slice(&67u16.to_be_bytes());
        assert_eq!(TrafficClass::of(ETHERTYPE_IPV4, &packet), TrafficClass::Dhcp);
    }

    #[test]
    fn test_dhcp_forced_to_lte_unsequenced() {
        for (lte, dsl) in [(false, false), (true, true), (false, true)] {
            assert_eq!(
                schedule(TrafficClass::Dhcp, &view(lte, dsl)),
                Some(SchedulerDecision {
                    tunnel: TunnelType::Lte,
                    sequenced: false
                })
            );
        }
    }

    #[test]
    fn test_data_prefers_dsl() {
        let decision = schedule(TrafficClass::Data, &view(true, true)).unwrap();
        assert_eq!(decision.tunnel, TunnelType::Dsl);
        assert!(decision.sequenced);

        let decision = schedule(TrafficClass::Data, &view(true, false)).unwrap();
        assert_eq!(decision.tunnel, TunnelType::Lte);
        assert!(decision.sequenced);

        assert_eq!(schedule(TrafficClass::Data, &view(false, false)), None);
    }

    #[test]
    fn test_scheduler_counts() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TrafficClass::Data, &view(true, true));
        scheduler.schedule(TrafficClass::Dhcp, &view(true, true));
        scheduler.schedule(TrafficClass::Data, &view(false, false));

        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                lte_packets: 1,
                dsl_packets: 1,
                unroutable: 1
            }
        );
    }
}
