pub mod annexb;
pub mod h264;
pub mod h265;
pub mod opus;
pub mod packetizer;
pub mod stream;
pub mod vp8;

pub use packetizer::Packetizer;
pub use stream::{DEFAULT_MTU, RtpStream, RtpStreamSpec};
