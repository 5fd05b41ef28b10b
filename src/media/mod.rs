pub mod packet;
pub mod params;

pub use packet::{EncodedPacket, TimeBase, combine_hi_lo};
pub use params::ParameterSets;
