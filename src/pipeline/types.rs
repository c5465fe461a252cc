//! Core types shared by the receive pipeline

use bytes::Bytes;

/// Kind of elementary stream carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// H.264 video
    Video,
    /// Opus audio
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// One complete, decodable unit of an elementary stream
///
/// For video this is a whole encoded picture in Annex B byte-stream form,
/// for audio a single Opus frame payload. Units are never partial.
#[derive(Clone)]
pub struct AccessUnit {
    /// Stream the unit belongs to
    pub kind: MediaKind,

    /// RTP timestamp shared by every packet of the unit
    pub timestamp: u32,

    /// Encoded payload
    pub data: Bytes,

    /// Whether the unit carries an IDR picture (video only)
    pub is_keyframe: bool,
}

impl AccessUnit {
    /// Get the size of the unit in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for AccessUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUnit")
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size())
            .finish()
    }
}

/// RTP timestamps wrap at 2^32; `a` is after `b` when the forward distance is under half the range.
pub fn timestamp_after(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff > 0 && diff < 0x8000_0000
}
