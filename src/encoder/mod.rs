//! External media tools: the transcoder that produces final artifacts and
//! the player used for live viewing.

mod ffmpeg;
mod player;

pub use ffmpeg::{TranscodeError, TranscodeOutcome, Transcoder};
pub use player::Player;
