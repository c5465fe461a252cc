pub mod pubsub;
pub mod sdm;
pub mod webrtc;

pub use pubsub::PubSubListener;
pub use sdm::SdmClient;
