//! Per-track media reassembly
//!
//! Chains the reorder buffer with the codec depacketizer. Packets go in
//! in arrival order, complete access units come out in capture order.

use log::{debug, trace};
use std::sync::Arc;

use super::reorder::{JitterBuffer, ReorderConfig, RtpPacket};
use crate::decoder::{self, Depacketizer};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::types::{AccessUnit, MediaKind, timestamp_after};

/// A step back in RTP time this large is a clock re-base, not reordering
const REBASE_TICKS: u32 = 90_000;

pub struct Reassembler {
    jitter: JitterBuffer,
    depacketizer: Box<dyn Depacketizer>,
    /// Sequence number of the last packet handed to the depacketizer
    last_seq: Option<u16>,
    /// Timestamp of the last emitted unit
    last_timestamp: Option<u32>,
    health: Arc<PipelineHealth>,
}

impl Reassembler {
    pub fn new(kind: MediaKind, config: ReorderConfig, health: Arc<PipelineHealth>) -> Self {
        Self::with_depacketizer(decoder::for_kind(kind), config, health)
    }

    pub fn with_depacketizer(
        depacketizer: Box<dyn Depacketizer>,
        config: ReorderConfig,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            jitter: JitterBuffer::new(config),
            depacketizer,
            last_seq: None,
            last_timestamp: None,
            health,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.depacketizer.kind()
    }

    /// Accept one packet and return the access units it completed.
    pub fn push(&mut self, packet: RtpPacket) -> Vec<AccessUnit> {
        if let Err(rejected) = self.jitter.insert(packet) {
            trace!("{} reassembler: {:?} packet dropped", self.kind(), rejected);
            self.health.record_late_packet();
        }
        let ready = self.jitter.drain_ready();
        self.depacketize(ready)
    }

    /// Give up on packets that waited too long behind a hole.
    pub fn poll(&mut self) -> Vec<AccessUnit> {
        if self.jitter.is_empty() {
            return Vec::new();
        }
        let ready = self.jitter.drain_ready();
        self.depacketize(ready)
    }

    /// Flush the reorder buffer at end of stream.
    ///
    /// Only units whose last packet was buffered are returned; a trailing
    /// unit still waiting for its marker is dropped.
    pub fn finish(&mut self) -> Vec<AccessUnit> {
        let rest = self.jitter.drain_all();
        let units = self.depacketize(rest);
        self.depacketizer.discard();
        units
    }

    /// (received, reordered, lost, buffered) packet counters
    pub fn stats(&self) -> (u64, u64, u64, usize) {
        self.jitter.stats()
    }

    fn depacketize(&mut self, packets: Vec<RtpPacket>) -> Vec<AccessUnit> {
        let mut units = Vec::new();

        for packet in packets {
            if let Some(last) = self.last_seq {
                let seq = packet.sequence_number;
                let missing = seq.wrapping_sub(last).wrapping_sub(1);
                if self.jitter.is_sequence_jump(last.wrapping_add(1), seq) {
                    debug!(
                        "{} reassembler: sequence restarted at {} (was {}), waiting for a fresh unit",
                        self.kind(),
                        seq,
                        last
                    );
                    self.depacketizer.reset();
                    self.last_timestamp = None;
                } else if missing > 0 {
                    debug!(
                        "{} reassembler: {} packet(s) missing before seq {}, dropping partial unit",
                        self.kind(),
                        missing,
                        seq
                    );
                    self.health.record_packet_loss(missing as u64);
                    self.depacketizer.discard();
                }
            }
            self.last_seq = Some(packet.sequence_number);

            self.depacketizer.push(&packet, &mut units);
        }

        // Capture order is never allowed to run backwards, except across a re-base
        units.retain(|unit| {
            let ts = unit.timestamp;
            let keep = match self.last_timestamp {
                None => true,
                Some(last) if last == ts || timestamp_after(ts, last) => true,
                Some(last) if last.wrapping_sub(ts) > REBASE_TICKS => {
                    debug!(
                        "{} reassembler: timestamp re-based from {} to {}",
                        self.depacketizer.kind(),
                        last,
                        ts
                    );
                    true
                }
                Some(_) => false,
            };
            if keep {
                self.last_timestamp = Some(ts);
            } else {
                self.health.record_unit_drop();
            }
            keep
        });

        units
    }
}
