//! RTP payload depacketization
//!
//! Turns ordered RTP payloads into elementary-stream access units:
//! Annex B H.264 pictures for video and bare Opus frames for audio.

mod depacketizer;

use crate::pipeline::receiver::RtpPacket;
use crate::pipeline::types::{AccessUnit, MediaKind};

pub use depacketizer::{H264Depacketizer, OpusDepacketizer};

/// Codec-specific payload reassembly for one track
pub trait Depacketizer: Send {
    /// Feed the next packet in sequence order; completed units are appended to `out`.
    fn push(&mut self, packet: &RtpPacket, out: &mut Vec<AccessUnit>);

    /// Drop the unit in progress after a sequence gap.
    fn discard(&mut self);

    /// Forget everything after the sender restarted its stream.
    fn reset(&mut self) {
        self.discard();
    }

    fn kind(&self) -> MediaKind;
}

/// Depacketizer for the codec a track of `kind` is negotiated with.
pub fn for_kind(kind: MediaKind) -> Box<dyn Depacketizer> {
    match kind {
        MediaKind::Video => Box::new(H264Depacketizer::new()),
        MediaKind::Audio => Box::new(OpusDepacketizer),
    }
}
