//! Device events and their deduplication

mod dedup;
mod events;

pub use dedup::DedupWindow;
pub use events::{CaptureEvent, EventKind};
