//! Reorder buffer for sequenced GRE data packets.
//!
//! Packets from the two links arrive interleaved and out of order because
//! the links have different round-trip times. The buffer holds them until
//! they can be released in sequence order, or until the oldest waiting
//! packet exceeds the reorder timeout, at which point the gap in front of
//! it is declared lost and skipped.
//!
//! Sequence numbers are 32 bits and wrap; all comparisons use serial number
//! arithmetic relative to the last released sequence.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Maximum number of packets held at once
pub const MAX_BUFFER_SIZE: usize = 1024;

/// Sequence expected when nothing has been released yet
pub const FIRST_SEQUENCE: u32 = 1;

/// Default cap for the adaptive timeout
pub const DEFAULT_ADAPTIVE_CAP: Duration = Duration::from_millis(100);

/// Reorder buffer errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReorderError {
    #[error("Duplicate packet detected: sequence {0}")]
    Duplicate(u32),

    #[error("Late packet: sequence {0}, already released up to {1}")]
    Late(u32, u32),

    #[error("Buffer full: cannot accept more packets")]
    BufferFull,
}

/// How long a packet may wait for its predecessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReorderPolicy {
    /// Release every packet as soon as it arrives
    Disabled,
    /// Fixed timeout
    Fixed {
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    /// Difference between the two links' round-trip times, capped
    Adaptive {
        #[serde(with = "humantime_serde")]
        cap: Duration,
    },
}

impl ReorderPolicy {
    /// Timeout to apply for the given link round-trip times.
    ///
    /// Returns `None` when reordering is disabled.
    pub fn timeout_for(&self, lte_rtt: Duration, dsl_rtt: Duration) -> Option<Duration> {
        match *self {
            Self::Disabled => None,
            Self::Fixed { timeout } => Some(timeout),
            Self::Adaptive { cap } => {
                let diff = if lte_rtt > dsl_rtt {
                    lte_rtt - dsl_rtt
                } else {
                    dsl_rtt - lte_rtt
                };
                Some(diff.min(cap))
            }
        }
    }
}

impl Default for ReorderPolicy {
    fn default() -> Self {
        Self::Adaptive {
            cap: DEFAULT_ADAPTIVE_CAP,
        }
    }
}

/// `a` comes after `b` in serial number order
fn serial_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Buffered packet with metadata
#[derive(Debug, Clone)]
struct BufferedPacket {
    sequence: u32,
    data: Vec<u8>,
    received_at: Instant,
}

/// Reorder buffer for one receive direction
pub struct ReorderBuffer {
    /// Last released sequence; `None` until the first release
    last_flushed: Option<u32>,
    /// Waiting packets in arrival order
    pending: Vec<BufferedPacket>,
    max_size: usize,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUFFER_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            last_flushed: None,
            pending: Vec::new(),
            max_size,
        }
    }

    /// Sequence that would be released next without waiting
    pub fn next_expected(&self) -> u32 {
        self.last_flushed
            .map_or(FIRST_SEQUENCE, |last| last.wrapping_add(1))
    }

    pub fn last_flushed(&self) -> Option<u32> {
        self.last_flushed
    }

    /// Packet with this sequence was already released or skipped
    fn is_late(&self, sequence: u32) -> bool {
        match self.last_flushed {
            Some(last) => !serial_after(sequence, last),
            None => false,
        }
    }

    /// Insert a sequenced packet
    pub fn insert(&mut self, sequence: u32, data: Vec<u8>, now: Instant) -> Result<(), ReorderError> {
        if let Some(last) = self.last_flushed {
            if self.is_late(sequence) {
                return Err(ReorderError::Late(sequence, last));
            }
        }

        if self.pending.iter().any(|p| p.sequence == sequence) {
            return Err(ReorderError::Duplicate(sequence));
        }

        if self.pending.len() >= self.max_size {
            return Err(ReorderError::BufferFull);
        }

        self.pending.push(BufferedPacket {
            sequence,
            data,
            received_at: now,
        });
        Ok(())
    }

    /// Release every packet that is in order or whose wait has timed out.
    ///
    /// Released packets come out in sequence order.
    pub fn retrieve(&mut self, now: Instant, timeout: Duration) -> Vec<(u32, Vec<u8>)> {
        let mut released = Vec::new();

        loop {
            self.flush_in_order(&mut released);

            let timed_out = self
                .pending
                .iter()
                .any(|p| now.saturating_duration_since(p.received_at) >= timeout);
            if !timed_out {
                break;
            }

            // Skip the hole in front of the lowest waiting sequence
            let Some(lowest) = self.lowest_pending() else {
                break;
            };
            tracing::trace!(
                "Reorder buffer: skipping from {} to {}",
                self.next_expected(),
                lowest
            );
            self.last_flushed = Some(lowest.wrapping_sub(1));
        }

        self.discard_late();
        released
    }

    fn flush_in_order(&mut self, released: &mut Vec<(u32, Vec<u8>)>) {
        loop {
            let expected = self.next_expected();
            let Some(index) = self.pending.iter().position(|p| p.sequence == expected) else {
                return;
            };
            let packet = self.pending.remove(index);
            tracing::trace!("Reorder buffer: flushed packet {}", packet.sequence);
            self.last_flushed = Some(packet.sequence);
            released.push((packet.sequence, packet.data));
        }
    }

    fn lowest_pending(&self) -> Option<u32> {
        let base = self.next_expected();
        self.pending
            .iter()
            .map(|p| p.sequence)
            .min_by_key(|seq| seq.wrapping_sub(base))
    }

    fn discard_late(&mut self) {
        let Some(last) = self.last_flushed else {
            return;
        };
        self.pending.retain(|p| {
            let keep = serial_after(p.sequence, last);
            if !keep {
                tracing::trace!("Reorder buffer: discarded late packet {}", p.sequence);
            }
            keep
        });
    }

    /// Current buffer size
    pub fn buffer_size(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget everything, including the last released sequence
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_flushed = None;
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(60);
    const SHORT: Duration = Duration::from_millis(10);

    fn sequences(released: &[(u32, Vec<u8>)]) -> Vec<u32> {
        released.iter().map(|(seq, _)| *seq).collect()
    }

    #[test]
    fn test_in_order_packets() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();

        for seq in 1..=3 {
            assert!(buffer.insert(seq, vec![seq as u8], now).is_ok());
        }

        let released = buffer.retrieve(now, LONG);
        assert_eq!(sequences(&released), vec![1, 2, 3]);
        assert_eq!(released[2].1, vec![3]);
        assert_eq!(buffer.next_expected(), 4);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_every_arrival_order_is_released_in_order() {
        // All 120 permutations of 1..=5
        fn permutations(items: Vec<u32>) -> Vec<Vec<u32>> {
            if items.len() <= 1 {
                return vec![items];
            }
            let mut out = Vec::new();
            for i in 0..items.len() {
                let mut rest = items.clone();
                let head = rest.remove(i);
                for mut tail in permutations(rest) {
                    tail.insert(0, head);
                    out.push(tail);
                }
            }
            out
        }

        let now = Instant::now();
        for order in permutations(vec![1, 2, 3, 4, 5]) {
            let mut buffer = ReorderBuffer::new();
            let mut released = Vec::new();
            for seq in &order {
                buffer.insert(*seq, Vec::new(), now).unwrap();
                released.extend(buffer.retrieve(now, LONG));
            }
            assert_eq!(sequences(&released), vec![1, 2, 3, 4, 5], "order {order:?}");
        }
    }

    #[test]
    fn test_gap_waits_until_timeout() {
        let mut buffer = ReorderBuffer::new();
        let start = Instant::now();

        buffer.insert(1, vec![1], start).unwrap();
        buffer.insert(3, vec![3], start).unwrap();
        buffer.insert(4, vec![4], start).unwrap();

        assert_eq!(sequences(&buffer.retrieve(start, SHORT)), vec![1]);
        assert_eq!(buffer.buffer_size(), 2);

        let later = start + SHORT;
        assert_eq!(sequences(&buffer.retrieve(later, SHORT)), vec![3, 4]);
        assert_eq!(buffer.last_flushed(), Some(4));

        // The skipped packet shows up after its deadline
        assert_eq!(
            buffer.insert(2, vec![2], later),
            Err(ReorderError::Late(2, 4))
        );
        assert!(buffer.retrieve(later, SHORT).is_empty());
    }

    #[test]
    fn test_timeout_releases_lowest_first() {
        let mut buffer = ReorderBuffer::new();
        let start = Instant::now();

        // 5 is old, 3 just arrived; both behind a missing 1 and 2
        buffer.insert(5, vec![], start).unwrap();
        buffer.insert(3, vec![], start + SHORT).unwrap();

        let released = buffer.retrieve(start + SHORT, SHORT);
        assert_eq!(sequences(&released), vec![3, 5]);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();

        buffer.insert(2, vec![1], now).unwrap();
        assert_eq!(
            buffer.insert(2, vec![2], now),
            Err(ReorderError::Duplicate(2))
        );
    }

    #[test]
    fn test_released_sequence_is_late() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();

        buffer.insert(1, vec![], now).unwrap();
        buffer.insert(2, vec![], now).unwrap();
        buffer.retrieve(now, LONG);

        assert!(matches!(
            buffer.insert(1, vec![], now),
            Err(ReorderError::Late(1, 2))
        ));
    }

    #[test]
    fn test_buffer_full() {
        let mut buffer = ReorderBuffer::with_capacity(3);
        let now = Instant::now();

        buffer.insert(2, vec![], now).unwrap();
        buffer.insert(3, vec![], now).unwrap();
        buffer.insert(4, vec![], now).unwrap();

        assert_eq!(
            buffer.insert(5, vec![], now),
            Err(ReorderError::BufferFull)
        );
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buffer = ReorderBuffer::new();
        let start = Instant::now();

        // Jump to just before the wrap
        buffer.insert(u32::MAX - 1, vec![], start).unwrap();
        assert_eq!(
            sequences(&buffer.retrieve(start + SHORT, SHORT)),
            vec![u32::MAX - 1]
        );

        let now = start + SHORT;
        buffer.insert(0, vec![], now).unwrap();
        buffer.insert(u32::MAX, vec![], now).unwrap();
        buffer.insert(1, vec![], now).unwrap();

        assert_eq!(
            sequences(&buffer.retrieve(now, LONG)),
            vec![u32::MAX, 0, 1]
        );
        assert!(matches!(
            buffer.insert(u32::MAX - 5, vec![], now),
            Err(ReorderError::Late(..))
        ));
    }

    #[test]
    fn test_reset() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();

        buffer.insert(1, vec![], now).unwrap();
        buffer.insert(3, vec![], now).unwrap();
        buffer.retrieve(now, LONG);
        assert_eq!(buffer.buffer_size(), 1);

        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_flushed(), None);
        assert_eq!(buffer.next_expected(), FIRST_SEQUENCE);
    }

    #[test]
    fn test_adaptive_timeout() {
        let policy = ReorderPolicy::default();
        let lte = Duration::from_millis(60);
        let dsl = Duration::from_millis(20);

        assert_eq!(policy.timeout_for(lte, dsl), Some(Duration::from_millis(40)));
        assert_eq!(policy.timeout_for(dsl, lte), Some(Duration::from_millis(40)));
        assert_eq!(
            policy.timeout_for(Duration::from_secs(1), dsl),
            Some(DEFAULT_ADAPTIVE_CAP)
        );
        assert_eq!(ReorderPolicy::Disabled.timeout_for(lte, dsl), None);
        assert_eq!(
            ReorderPolicy::Fixed { timeout: SHORT }.timeout_for(lte, dsl),
            Some(SHORT)
        );
    }
}
