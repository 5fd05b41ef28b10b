//! Codec dispatch over the RTP payload formatters.

use crate::common::errors::{Result, StreamError};
use crate::config::VideoCodec;
use crate::media::ParameterSets;
use crate::rtp::h264::H264Packetizer;
use crate::rtp::h265::H265Packetizer;
use crate::rtp::opus::OpusPacketizer;
use crate::rtp::stream::RtpStream;
use crate::rtp::vp8::Vp8Packetizer;

/// The per-session packetizer, selected once from the stream options.
pub enum Packetizer {
    Opus(OpusPacketizer),
    H264(H264Packetizer),
    H265(H265Packetizer),
    Vp8(Vp8Packetizer),
}

impl Packetizer {
    pub fn opus(stream: RtpStream) -> Self {
        Packetizer::Opus(OpusPacketizer::new(stream))
    }

    /// Builds the video packetizer for `codec`. VP9 and AV1 appear in the
    /// advertised catalog but have no payload formatter here.
    pub fn video(
        codec: VideoCodec,
        stream: RtpStream,
        params: Option<&ParameterSets>,
    ) -> Result<Self> {
        match codec {
            VideoCodec::H264 => Ok(Packetizer::H264(H264Packetizer::new(stream, params)?)),
            VideoCodec::H265 => Ok(Packetizer::H265(H265Packetizer::new(stream, params)?)),
            VideoCodec::VP8 => Ok(Packetizer::Vp8(Vp8Packetizer::new(stream))),
            VideoCodec::VP9 | VideoCodec::AV1 => Err(StreamError::Config(format!(
                "no packetizer for {} streams",
                codec.wire_name()
            ))),
        }
    }

    /// Packetizes, encrypts and sends one frame, then advances the RTP
    /// timestamp by `frametime_ms`.
    pub async fn send_frame(&mut self, frame: &[u8], frametime_ms: f64) -> Result<()> {
        match self {
            Packetizer::Opus(p) => p.send_frame(frame, frametime_ms).await,
            Packetizer::H264(p) => p.send_frame(frame, frametime_ms).await,
            Packetizer::H265(p) => p.send_frame(frame, frametime_ms).await,
            Packetizer::Vp8(p) => p.send_frame(frame, frametime_ms).await,
        }
    }

    pub fn stream(&self) -> &RtpStream {
        match self {
            Packetizer::Opus(p) => p.stream(),
            Packetizer::H264(p) => p.stream(),
            Packetizer::H265(p) => p.stream(),
            Packetizer::Vp8(p) => p.stream(),
        }
    }
}
