use bytes::{BufMut, BytesMut};

use super::Depacketizer;
use crate::pipeline::receiver::RtpPacket;
use crate::pipeline::types::{AccessUnit, MediaKind};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_IDR: u8 = 5;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Reassembles H.264 NAL units from RTP packets (RFC 6184)
/// into complete Annex B access units.
pub struct H264Depacketizer {
    buffer: BytesMut,
    /// RTP timestamp of the unit being built
    timestamp: Option<u32>,
    seen_idr: bool,
    in_fua_fragment: bool,
    /// After a gap, packets are dropped until the next unit boundary
    discarding: bool,
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            timestamp: None,
            seen_idr: false,
            in_fua_fragment: false,
            discarding: false,
        }
    }

    fn push_payload(&mut self, payload: &[u8]) {
        let nal_type = payload[0] & 0x1F;

        match nal_type {
            // Single NAL unit (types 1-23)
            1..=23 => self.push_nal(payload),
            NAL_STAP_A => {
                let mut offset = 1; // skip aggregation header
                while offset + 2 <= payload.len() {
                    let nalu_len =
                        u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if nalu_len == 0 || offset + nalu_len > payload.len() {
                        break;
                    }
                    self.push_nal(&payload[offset..offset + nalu_len]);
                    offset += nalu_len;
                }
            }
            NAL_FU_A => {
                if payload.len() < 2 {
                    return;
                }
                let fu_indicator = payload[0];
                let fu_header = payload[1];
                let start = (fu_header & 0x80) != 0;
                let end = (fu_header & 0x40) != 0;

                if start {
                    if self.in_fua_fragment {
                        log::warn!("FU-A: new start while previous fragment incomplete");
                        self.discard();
                        return;
                    }
                    self.in_fua_fragment = true;
                    // NRI from the indicator, type from the FU header
                    let nal_header = (fu_indicator & 0xE0) | (fu_header & 0x1F);
                    self.buffer.put_slice(&START_CODE);
                    self.buffer.put_u8(nal_header);
                } else if !self.in_fua_fragment {
                    // Middle/end packet without a start: the start was lost
                    self.discard();
                    return;
                }

                self.buffer.put_slice(&payload[2..]);

                if end {
                    self.in_fua_fragment = false;
                }
            }
            // STAP-B, MTAP and FU-B are not used in packetization-mode=1
            _ => {}
        }
    }

    /// Close the unit being built and return it if it is decodable.
    fn drain_au(&mut self) -> Option<AccessUnit> {
        let timestamp = self.timestamp.take()?;
        self.in_fua_fragment = false;

        if self.discarding {
            self.discarding = false;
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() {
            return None;
        }

        let data = self.buffer.split().freeze();
        let is_keyframe = contains_nal_type(&data, NAL_IDR);

        if !self.seen_idr {
            if !is_keyframe {
                // Units before the first IDR cannot be decoded
                return None;
            }
            self.seen_idr = true;
        }

        Some(AccessUnit {
            kind: MediaKind::Video,
            timestamp,
            data,
            is_keyframe,
        })
    }

    #[inline]
    fn push_nal(&mut self, payload: &[u8]) {
        self.buffer.put_slice(&START_CODE);
        self.buffer.put_slice(payload);
    }
}

impl Depacketizer for H264Depacketizer {
    fn push(&mut self, packet: &RtpPacket, out: &mut Vec<AccessUnit>) {
        // A new timestamp closes the previous unit even if its marker never came
        if self.timestamp.is_some_and(|ts| ts != packet.timestamp) {
            out.extend(self.drain_au());
        }
        self.timestamp = Some(packet.timestamp);

        if !packet.payload.is_empty() && !self.discarding {
            self.push_payload(&packet.payload);
        }

        if packet.marker {
            out.extend(self.drain_au());
        }
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.in_fua_fragment = false;
        self.discarding = true;
    }

    /// Units are dropped again until the next IDR.
    fn reset(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
        self.seen_idr = false;
        self.in_fua_fragment = false;
        self.discarding = false;
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }
}

/// Scan Annex B data for a NAL unit with the given type.
pub fn contains_nal_type(data: &[u8], target_type: u8) -> bool {
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] == START_CODE {
            if (data[i + 4] & 0x1F) == target_type {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}

/// Opus carries exactly one frame per RTP payload.
#[derive(Default)]
pub struct OpusDepacketizer;

impl Depacketizer for OpusDepacketizer {
    fn push(&mut self, packet: &RtpPacket, out: &mut Vec<AccessUnit>) {
        if packet.payload.is_empty() {
            return;
        }
        out.push(AccessUnit {
            kind: MediaKind::Audio,
            timestamp: packet.timestamp,
            data: packet.payload.clone(),
            is_keyframe: false,
        });
    }

    fn discard(&mut self) {}

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }
}
