//! Data-plane pipelines between the GRE links and the tunnel device.
//!
//! Both halves are synchronous and do no I/O: they turn packets into
//! frames and back, and the runtime moves the bytes. Each half is owned by
//! exactly one task.

use crate::proto::{GreHeader, TunnelType, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::reorder::{ReorderBuffer, ReorderError, ReorderPolicy};
use crate::scheduler::{Scheduler, SchedulerStats, TrafficClass};
use crate::session::LinkView;
use crate::tun::{frame, split_frame};
use std::time::{Duration, Instant};

/// How often the ingress side revisits reorder timeouts without traffic
pub const REORDER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Ingress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub delivered: u64,
    pub malformed: u64,
    pub wrong_key: u64,
    pub unsupported_protocol: u64,
    pub late: u64,
    pub duplicate: u64,
    pub overflow: u64,
}

/// GRE to tunnel device: filter, decapsulate, reorder
pub struct Decapsulator {
    buffer: ReorderBuffer,
    policy: ReorderPolicy,
    stats: IngressStats,
}

impl Decapsulator {
    pub fn new(policy: ReorderPolicy) -> Self {
        Self {
            buffer: ReorderBuffer::new(),
            policy,
            stats: IngressStats::default(),
        }
    }

    /// Handle one received data packet.
    ///
    /// Returns the frames now ready for the tunnel device, in order.
    pub fn on_packet(&mut self, packet: &[u8], view: &LinkView, now: Instant) -> Vec<Vec<u8>> {
        let (header, offset) = match GreHeader::decode(packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!("Discarding data packet: {e}");
                return Vec::new();
            }
        };

        if header.key != view.bonding_key {
            self.stats.wrong_key += 1;
            tracing::trace!("Discarding data packet with key 0x{:08X}", header.key);
            return Vec::new();
        }

        if !matches!(header.protocol, ETHERTYPE_IPV4 | ETHERTYPE_IPV6) {
            self.stats.unsupported_protocol += 1;
            tracing::trace!("Discarding data packet with protocol 0x{:04X}", header.protocol);
            return Vec::new();
        }

        let framed = frame(header.protocol, &packet[offset..]);
        let timeout = self.timeout(view);

        let (Some(sequence), Some(timeout)) = (header.sequence, timeout) else {
            self.stats.delivered += 1;
            return vec![framed];
        };

        match self.buffer.insert(sequence, framed, now) {
            Ok(()) => {}
            Err(e) => {
                match e {
                    ReorderError::Late(..) => self.stats.late += 1,
                    ReorderError::Duplicate(_) => self.stats.duplicate += 1,
                    ReorderError::BufferFull => {
                        self.stats.overflow += 1;
                        tracing::warn!("Reorder buffer full, dropping packet {sequence}");
                    }
                }
                tracing::trace!("Reorder buffer: {e}");
            }
        }
        self.release(now, timeout)
    }

    /// Release packets whose wait has timed out
    pub fn on_tick(&mut self, view: &LinkView, now: Instant) -> Vec<Vec<u8>> {
        match self.timeout(view) {
            Some(timeout) if !self.buffer.is_empty() => self.release(now, timeout),
            _ => Vec::new(),
        }
    }

    fn timeout(&self, view: &LinkView) -> Option<Duration> {
        self.policy.timeout_for(view.lte_rtt, view.dsl_rtt)
    }

    fn release(&mut self, now: Instant, timeout: Duration) -> Vec<Vec<u8>> {
        let frames: Vec<Vec<u8>> = self
            .buffer
            .retrieve(now, timeout)
            .into_iter()
            .map(|(_, data)| data)
            .collect();
        self.stats.delivered += frames.len() as u64;
        frames
    }

    /// Start over, as for a new session
    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    pub fn pending(&self) -> usize {
        self.buffer.buffer_size()
    }

    pub fn stats(&self) -> IngressStats {
        self.stats
    }
}

/// Tunnel device to GRE: select a link, encapsulate
pub struct Encapsulator {
    next_sequence: u32,
    scheduler: Scheduler,
}

impl Encapsulator {
    pub fn new() -> Self {
        Self {
            next_sequence: 0,
            scheduler: Scheduler::new(),
        }
    }

    /// Encapsulate one frame from the tunnel device.
    ///
    /// Returns the link and the GRE packet to send, or `None` if the frame
    /// is dropped.
    pub fn encapsulate(&mut self, frame: &[u8], view: &LinkView) -> Option<(TunnelType, Vec<u8>)> {
        let (ethertype, payload) = split_frame(frame)?;
        if !matches!(ethertype, ETHERTYPE_IPV4 | ETHERTYPE_IPV6) {
            tracing::trace!("Ignoring frame with EtherType 0x{ethertype:04X}");
            return None;
        }

        let class = TrafficClass::of(ethertype, payload);
        let Some(decision) = self.scheduler.schedule(class, view) else {
            tracing::error!("Sending packet failed: all tunnels are down");
            return None;
        };

        let sequence = decision.sequenced.then(|| {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            sequence
        });

        let header = GreHeader::new(ethertype, view.bonding_key, sequence);
        let mut packet = Vec::with_capacity(header.encoded_len() + payload.len());
        header.encode_into(&mut packet);
        packet.extend_from_slice(payload);

        tracing::trace!(
            "Sending {} bytes via {}{}",
            payload.len(),
            decision.tunnel,
            if decision.sequenced { "" } else { " (forced)" }
        );
        Some((decision.tunnel, packet))
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}

impl Default for Encapsulator {
    fn default() -> Self {
        Self::new()
    }
}
