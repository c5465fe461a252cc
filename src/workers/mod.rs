//! Capture workers
//!
//! Long-running tasks that turn device events and user commands into
//! captures: admission control, event dispatch and the stream recorder.

pub mod admission;
pub mod capture;
pub mod orchestrator;
pub mod recorder;

pub use capture::DeviceCapture;
pub use orchestrator::{CaptureOrchestrator, CapturePolicy, CaptureRunner, JobOutcome};
pub use recorder::{CaptureMode, Recorder};
