//! Per-track reassembly counters

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Health metrics for one track's reader
///
/// All fields use atomic operations so the reader task can update them
/// while a capture job polls progress.
pub struct PipelineHealth {
    /// Access units written to the sink
    pub units_written: AtomicU64,

    /// Bytes written to the sink
    pub bytes_written: AtomicU64,

    /// Keyframes written to the sink
    pub keyframes_written: AtomicU64,

    /// Incomplete units discarded after a gap
    pub units_dropped: AtomicU64,

    /// Packets given up on by the reorder window
    pub packets_lost: AtomicU64,

    /// Packets that arrived after their slot was released, or twice
    pub packets_late: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last written unit
    pub last_unit_time: AtomicU64,

    /// The remote side closed the track or reading it failed
    pub track_ended: AtomicBool,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            units_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            keyframes_written: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            packets_late: AtomicU64::new(0),
            last_unit_time: AtomicU64::new(now_micros()),
            track_ended: AtomicBool::new(false),
        }
    }

    /// Record a unit handed to the sink
    pub fn record_unit(&self, size: usize, is_keyframe: bool) {
        self.last_unit_time.store(now_micros(), Ordering::Relaxed);
        self.units_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_written.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unit_drop(&self) {
        self.units_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_loss(&self, count: u64) {
        self.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_late_packet(&self) {
        self.packets_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_track_end(&self) {
        self.track_ended.store(true, Ordering::Relaxed);
    }

    /// Whether the track stopped on its own rather than by cancellation
    pub fn track_ended(&self) -> bool {
        self.track_ended.load(Ordering::Relaxed)
    }

    pub fn units_written(&self) -> u64 {
        self.units_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn keyframes_written(&self) -> u64 {
        self.keyframes_written.load(Ordering::Relaxed)
    }

    pub fn units_dropped(&self) -> u64 {
        self.units_dropped.load(Ordering::Relaxed)
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    pub fn packets_late(&self) -> u64 {
        self.packets_late.load(Ordering::Relaxed)
    }

    /// Check if the track has stalled (no units for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_unit_time.load(Ordering::Relaxed);
        now_micros().saturating_sub(last) > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            units_written: self.units_written(),
            bytes_written: self.bytes_written(),
            keyframes_written: self.keyframes_written(),
            units_dropped: self.units_dropped(),
            packets_lost: self.packets_lost(),
            packets_late: self.packets_late(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub units_written: u64,
    pub bytes_written: u64,
    pub keyframes_written: u64,
    pub units_dropped: u64,
    pub packets_lost: u64,
    pub packets_late: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} units ({} keyframes, {} bytes), {} dropped units, {} lost packets, {} late packets",
            self.units_written,
            self.keyframes_written,
            self.bytes_written,
            self.units_dropped,
            self.packets_lost,
            self.packets_late
        )
    }
}
