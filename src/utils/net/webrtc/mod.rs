mod common;
mod heartbeat;
mod session;

pub use heartbeat::StreamControl;
pub use session::{InboundTrack, StreamSession};
