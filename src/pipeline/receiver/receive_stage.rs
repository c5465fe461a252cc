//! Track reader for the receiver pipeline
//!
//! Pulls RTP packets from one inbound track, reassembles them and writes
//! the resulting access units to the track's sink until the track ends,
//! the sink fails or the session is cancelled.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::reassembler::Reassembler;
use super::reorder::RtpPacket;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::sink::OutputSink;
use crate::pipeline::types::{AccessUnit, MediaKind};
use crate::utils::sos::SignalOfStop;

/// Source of inbound RTP packets for one track
#[async_trait]
pub trait RtpSource: Send {
    /// Next packet, or `None` once the remote side closed the track.
    async fn read_packet(&mut self) -> Result<Option<RtpPacket>>;

    fn kind(&self) -> MediaKind;
}

/// How often packets stuck behind a hole are re-examined
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Receive stage: one reader task per inbound track
pub struct ReceiveStage {
    source: Box<dyn RtpSource>,
    reassembler: Reassembler,
    sink: Box<dyn OutputSink>,
    health: Arc<PipelineHealth>,
    sos: SignalOfStop,
}

impl ReceiveStage {
    pub fn new(
        source: Box<dyn RtpSource>,
        reassembler: Reassembler,
        sink: Box<dyn OutputSink>,
        health: Arc<PipelineHealth>,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            source,
            reassembler,
            sink,
            health,
            sos,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.health.clone()
    }

    async fn write_units(&mut self, units: Vec<AccessUnit>) -> Result<()> {
        for unit in units {
            self.sink.write_unit(&unit).await?;
            self.health.record_unit(unit.size(), unit.is_keyframe);
        }
        Ok(())
    }

    async fn read_loop(&mut self) -> Result<()> {
        let kind = self.source.kind();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut total_packets = 0u64;

        loop {
            let packet = tokio::select! {
                _ = self.sos.wait_cancellation() => {
                    debug!("{} reader: cancelled", kind);
                    break;
                }
                _ = poll.tick() => {
                    let units = self.reassembler.poll();
                    self.write_units(units).await?;
                    continue;
                }
                read = self.source.read_packet() => read,
            };

            match packet {
                Ok(Some(packet)) => {
                    total_packets += 1;
                    if total_packets == 1 {
                        info!(
                            "{} reader: first packet received (seq: {})",
                            kind, packet.sequence_number
                        );
                    }
                    let units = self.reassembler.push(packet);
                    self.write_units(units).await?;
                }
                Ok(None) => {
                    info!("{} reader: track closed by remote", kind);
                    self.health.record_track_end();
                    break;
                }
                Err(e) => {
                    warn!("{} reader: track read failed: {:#}", kind, e);
                    self.health.record_track_end();
                    break;
                }
            }
        }

        let units = self.reassembler.finish();
        self.write_units(units).await
    }
}

#[async_trait]
impl PipelineStage for ReceiveStage {
    async fn run(&mut self) -> Result<()> {
        let kind = self.source.kind();
        info!("{} reader: started, writing to {}", kind, self.sink.describe());

        let result = self.read_loop().await;
        if let Err(e) = &result {
            warn!("{} reader: stopping after sink error: {:#}", kind, e);
        }

        let (received, reordered, lost, _) = self.reassembler.stats();
        info!(
            "{} reader: finished ({} packets, {} reordered, {} skipped; {})",
            kind,
            received,
            reordered,
            lost,
            self.health.summary()
        );
        result
    }

    fn name(&self) -> &'static str {
        "ReceiveStage"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.sink.finish().await
    }
}
