//! Receiver pipeline components
//!
//! - ReceiveStage: reads one track and drives the reassembler
//! - Reassembler: reorder buffer plus depacketizer
//! - JitterBuffer: sequence-window packet reordering

pub mod reassembler;
pub mod receive_stage;
pub mod reorder;

pub use reassembler::Reassembler;
pub use receive_stage::{ReceiveStage, RtpSource};
pub use reorder::{ReorderConfig, RtpPacket};
