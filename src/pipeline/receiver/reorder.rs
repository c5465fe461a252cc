//! Sequence-window reorder buffer for inbound RTP packets
//!
//! Packets are held in sequence order until the next expected sequence
//! number arrives. A missing packet is given up on once the window is
//! full or the oldest buffered packet has waited longer than the allowed
//! delay, so memory and latency stay bounded under loss.
//!
//! A packet far outside the window in either direction is held aside. If
//! the next packet continues from it, the sender restarted its sequence
//! and the buffer resyncs there; otherwise it is dropped as a stray.

use bytes::Bytes;
use log::debug;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// An RTP packet with the fields reassembly needs
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub payload: Bytes,
    pub marker: bool,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub received_at: Instant,
}

/// Reorder buffer configuration
#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// Maximum number of packets held while waiting for a missing one
    pub window: usize,
    /// Longest a packet may wait behind a missing one
    pub max_delay: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            window: 128,
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Why `insert` refused a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Sequence number already released
    Late,
    /// Sequence number already buffered
    Duplicate,
}

/// Smallest sequence distance treated as a restart rather than reordering
const MIN_RESYNC_GAP: usize = 1024;

/// Check if seq_a comes after seq_b (handling wrapping)
pub fn seq_comes_after(seq_a: u16, seq_b: u16) -> bool {
    let diff = seq_a.wrapping_sub(seq_b);
    diff > 0 && diff < 0x8000
}

/// Jitter buffer for packet reordering
///
/// Implements a sliding-window buffer that:
/// 1. Buffers incoming packets ordered by sequence number
/// 2. Releases packets as soon as they are contiguous with the last release
/// 3. Skips a missing packet once the window fills or it is overdue
/// 4. Refuses packets that fall before the release point
pub struct JitterBuffer {
    /// Ordered buffer of packets (by sequence number)
    buffer: VecDeque<RtpPacket>,
    /// Expected next sequence number
    expected_seq: Option<u16>,
    /// Packets released by a resync, returned ahead of everything else
    released: Vec<RtpPacket>,
    /// Far-away packet waiting for a follower to confirm a resync
    stray: Option<RtpPacket>,
    resync_gap: u16,
    config: ReorderConfig,
    packets_received: u64,
    packets_reordered: u64,
    packets_lost: u64,
}

impl JitterBuffer {
    pub fn new(config: ReorderConfig) -> Self {
        let window = config.window.max(1);
        Self {
            buffer: VecDeque::with_capacity(window),
            expected_seq: None,
            released: Vec::new(),
            stray: None,
            resync_gap: window.saturating_mul(4).clamp(MIN_RESYNC_GAP, 0x4000) as u16,
            config: ReorderConfig { window, ..config },
            packets_received: 0,
            packets_reordered: 0,
            packets_lost: 0,
        }
    }

    /// Whether `seq` is too far from `expected` to be reordering.
    pub fn is_sequence_jump(&self, expected: u16, seq: u16) -> bool {
        (seq.wrapping_sub(expected) as i16).unsigned_abs() > self.resync_gap
    }

    /// Insert a packet into the buffer
    pub fn insert(&mut self, packet: RtpPacket) -> Result<(), Rejected> {
        let seq = packet.sequence_number;
        let expected = *self.expected_seq.get_or_insert(seq);

        if self.is_sequence_jump(expected, seq) {
            return self.hold_stray(packet);
        }
        if let Some(stray) = self.stray.take() {
            debug!("Reorder: dropping stray packet seq {}", stray.sequence_number);
        }
        if seq_comes_after(expected, seq) {
            return Err(Rejected::Late);
        }
        if self.buffer.iter().any(|p| p.sequence_number == seq) {
            return Err(Rejected::Duplicate);
        }

        self.packets_received += 1;

        // Keep ascending order: insert before the first packet that comes after this one
        match self
            .buffer
            .iter()
            .position(|p| seq_comes_after(p.sequence_number, seq))
        {
            Some(i) => {
                self.buffer.insert(i, packet);
                self.packets_reordered += 1;
            }
            None => self.buffer.push_back(packet),
        }

        Ok(())
    }

    fn hold_stray(&mut self, packet: RtpPacket) -> Result<(), Rejected> {
        let seq = packet.sequence_number;
        let Some(stray) = self.stray.take() else {
            self.stray = Some(packet);
            return Ok(());
        };

        let from = stray.sequence_number;
        if seq == from {
            self.stray = Some(stray);
            return Err(Rejected::Duplicate);
        }
        if self.is_sequence_jump(from, seq) {
            debug!("Reorder: dropping stray packet seq {}", from);
            self.stray = Some(packet);
            return Ok(());
        }

        debug!(
            "Reorder: sequence jumped from {:?} to {}, resyncing",
            self.expected_seq, from
        );
        let flushed = self.drain_all();
        self.released.extend(flushed);

        let start = if seq_comes_after(from, seq) { seq } else { from };
        self.expected_seq = Some(start);
        self.insert(stray)?;
        self.insert(packet)
    }

    /// Drain packets that are ready to be output
    ///
    /// A skipped sequence number shows up as a discontinuity between two
    /// consecutive released packets.
    pub fn drain_ready(&mut self) -> Vec<RtpPacket> {
        self.drain(Instant::now())
    }

    fn drain(&mut self, now: Instant) -> Vec<RtpPacket> {
        let mut output = std::mem::take(&mut self.released);

        while let (Some(expected), Some(front)) = (self.expected_seq, self.buffer.front()) {
            if front.sequence_number == expected {
                if let Some(pkt) = self.buffer.pop_front() {
                    self.expected_seq = Some(expected.wrapping_add(1));
                    output.push(pkt);
                }
                continue;
            }

            let overdue = now.saturating_duration_since(front.received_at) > self.config.max_delay;
            if self.buffer.len() >= self.config.window || overdue {
                let missing = front.sequence_number.wrapping_sub(expected);
                debug!(
                    "Reorder: giving up on {} packet(s) from seq {}",
                    missing, expected
                );
                self.packets_lost += missing as u64;
                self.expected_seq = Some(front.sequence_number);
                continue;
            }
            break;
        }

        output
    }

    /// Release everything still buffered in sequence order, skipping holes
    pub fn drain_all(&mut self) -> Vec<RtpPacket> {
        let mut output = std::mem::take(&mut self.released);
        output.reserve(self.buffer.len());
        while let Some(pkt) = self.buffer.pop_front() {
            if let Some(expected) = self.expected_seq {
                self.packets_lost += pkt.sequence_number.wrapping_sub(expected) as u64;
            }
            self.expected_seq = Some(pkt.sequence_number.wrapping_add(1));
            output.push(pkt);
        }
        output
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.released.is_empty()
    }

    /// (received, reordered, lost, buffered)
    pub fn stats(&self) -> (u64, u64, u64, usize) {
        (
            self.packets_received,
            self.packets_reordered,
            self.packets_lost,
            self.buffer.len(),
        )
    }
}
