pub mod constants;
pub mod session;

pub use session::{VoiceConnection, VoiceHandle};
pub use session::types::{SessionKeys, WebRtcParameters};
