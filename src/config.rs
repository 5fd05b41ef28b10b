//! Stream configuration.
//!
//! `StreamOptions` is assembled by the host before a session starts and is
//! immutable once protocol selection has completed. Only the video codec
//! choice gates which packetizer is constructed; the full codec catalog is
//! always advertised during protocol selection.

use serde::{Deserialize, Serialize};

/// Video codecs a session can be configured with.
///
/// Packetizers exist for H264, H265 and VP8. VP9 and AV1 are advertised in
/// the protocol-selection codec catalog but cannot be selected as the
/// session codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    VP8,
    VP9,
    AV1,
}

impl VideoCodec {
    /// The codec name as the voice gateway spells it.
    pub fn wire_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
            VideoCodec::AV1 => "AV1",
        }
    }

    /// Fixed RTP payload type for this codec.
    pub fn payload_type(self) -> u8 {
        match self {
            VideoCodec::H264 => 101,
            VideoCodec::H265 => 103,
            VideoCodec::VP8 => 105,
            VideoCodec::VP9 => 107,
            VideoCodec::AV1 => 109,
        }
    }

    /// Fixed RTX payload type, advertised alongside [`Self::payload_type`].
    pub fn rtx_payload_type(self) -> u8 {
        self.payload_type() + 1
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "H264" | "h264" => Ok(VideoCodec::H264),
            "H265" | "h265" | "hevc" => Ok(VideoCodec::H265),
            "VP8" | "vp8" => Ok(VideoCodec::VP8),
            "VP9" | "vp9" => Ok(VideoCodec::VP9),
            "AV1" | "av1" => Ok(VideoCodec::AV1),
            other => Err(format!("unknown video codec '{other}'")),
        }
    }
}

/// RTP payload type for Opus audio.
pub const OPUS_PAYLOAD_TYPE: u8 = 120;

/// Encoder speed/quality preset forwarded to the external H.26x encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum H26xPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
}

/// Options for an outgoing media stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Target average bitrate in kbps, forwarded to the encoder.
    #[serde(default = "default_avg_bitrate")]
    pub avg_bitrate_kbps: u32,
    /// Bitrate ceiling in kbps, also advertised in the video status opcode.
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_kbps: u32,
    #[serde(default = "default_video_codec")]
    pub video_codec: VideoCodec,
    /// Emit periodic RTCP Sender Reports on both streams.
    #[serde(default = "default_true")]
    pub rtcp_sender_reports: bool,
    /// Pick XChaCha20-Poly1305 even when the peer supports AES-256-GCM.
    #[serde(default)]
    pub force_chacha20_encryption: bool,
    /// Tune the external encoder for latency over quality.
    #[serde(default = "default_true")]
    pub minimize_latency: bool,
    #[serde(default = "default_preset")]
    pub h26x_preset: H26xPreset,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_avg_bitrate() -> u32 {
    1000
}

fn default_max_bitrate() -> u32 {
    2500
}

fn default_video_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_preset() -> H26xPreset {
    H26xPreset::Ultrafast
}

fn default_true() -> bool {
    true
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            avg_bitrate_kbps: default_avg_bitrate(),
            max_bitrate_kbps: default_max_bitrate(),
            video_codec: default_video_codec(),
            rtcp_sender_reports: true,
            force_chacha20_encryption: false,
            minimize_latency: true,
            h26x_preset: default_preset(),
        }
    }
}

impl StreamOptions {
    /// Default Sender Report interval for the video stream, in packets.
    ///
    /// Roughly one report every five seconds assuming ~3 packets per frame.
    pub fn video_sr_interval(&self) -> u64 {
        5 * self.fps as u64 * 3
    }

    /// Default Sender Report interval for the audio stream, in packets.
    ///
    /// 250 packets is ~5 s at the 20 ms Opus frame time; the cadence scales
    /// with the actual frame duration.
    pub fn audio_sr_interval(&self) -> u64 {
        250
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = StreamOptions::default();
        assert_eq!(opts.width, 1280);
        assert_eq!(opts.fps, 30);
        assert_eq!(opts.video_codec, VideoCodec::H264);
        assert!(opts.rtcp_sender_reports);
        assert!(!opts.force_chacha20_encryption);
    }

    #[test]
    fn payload_types_are_fixed() {
        assert_eq!(VideoCodec::H264.payload_type(), 101);
        assert_eq!(VideoCodec::H264.rtx_payload_type(), 102);
        assert_eq!(VideoCodec::H265.payload_type(), 103);
        assert_eq!(VideoCodec::VP8.payload_type(), 105);
        assert_eq!(VideoCodec::VP9.payload_type(), 107);
        assert_eq!(VideoCodec::AV1.payload_type(), 109);
        assert_eq!(OPUS_PAYLOAD_TYPE, 120);
    }

    #[test]
    fn sr_intervals_track_fps() {
        let opts = StreamOptions {
            fps: 25,
            ..Default::default()
        };
        assert_eq!(opts.video_sr_interval(), 375);
        assert_eq!(opts.audio_sr_interval(), 250);
    }

    #[test]
    fn deserialize_partial() {
        let opts: StreamOptions =
            serde_json::from_str(r#"{"fps": 60, "video_codec": "VP8"}"#).unwrap();
        assert_eq!(opts.fps, 60);
        assert_eq!(opts.video_codec, VideoCodec::VP8);
        assert_eq!(opts.width, 1280);
    }
}
