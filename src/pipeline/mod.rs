//! Receive pipeline
//!
//! Turns inbound RTP tracks into elementary streams:
//! - Reorder: sequence-window jitter buffer per track
//! - Reassembly: codec depacketization into access units
//! - Sinks: file, stdout or pipe destinations for the raw stream
//! - Health: per-track counters logged when a reader ends
//!
//! ```text
//! Track → Reorder → Depacketize → Sink
//! ```

pub mod health;
pub mod receiver;
pub mod sink;
pub mod stage;
pub mod state;
pub mod types;

pub use health::PipelineHealth;
pub use stage::PipelineStage;
pub use state::SessionState;
pub use types::MediaKind;
