//! Opus audio packetizer.

use crate::common::errors::Result;
use crate::rtp::stream::RtpStream;

/// One RTP packet per encoded Opus packet: marker always set, no extension
/// header, no fragmentation.
pub struct OpusPacketizer {
    stream: RtpStream,
}

impl OpusPacketizer {
    pub fn new(stream: RtpStream) -> Self {
        Self { stream }
    }

    pub async fn send_frame(&mut self, frame: &[u8], frametime_ms: f64) -> Result<()> {
        self.stream.send_packet(frame, true).await?;
        self.stream.advance_timestamp(frametime_ms);
        Ok(())
    }

    pub fn stream(&self) -> &RtpStream {
        &self.stream
    }
}
