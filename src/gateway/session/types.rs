use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::common::errors::{Result, StreamError};
use crate::config::{OPUS_PAYLOAD_TYPE, StreamOptions, VideoCodec};
use crate::crypto::CipherMode;

/// Every voice gateway frame is `{op, d}` JSON.
#[derive(Serialize, Deserialize, Debug)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    pub d: Value,
}

/// Outcome of a single WS session — tells the outer loop what to do next.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Resumable disconnect — reconnect and send RESUME.
    Resume,
    /// Local stop requested; wind down cleanly.
    Stopped,
}

/// Close codes that allow a RESUME once the session reached Identified:
/// 4015 (server crashed) and everything below the 4xxx error range.
pub fn is_resumable_close(code: u16) -> bool {
    code == 4015 || code < 4000
}

/// Transport parameters delivered by the READY message; stable for the
/// whole session.
#[derive(Debug, Clone)]
pub struct WebRtcParameters {
    pub ip: String,
    pub port: u16,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub rtx_ssrc: u32,
    /// AEAD modes the server supports, in its preference order.
    pub modes: Vec<String>,
}

impl WebRtcParameters {
    pub fn from_ready(d: &Value) -> Result<Self> {
        let audio_ssrc = d["ssrc"]
            .as_u64()
            .ok_or(StreamError::ProtocolState("READY without ssrc"))? as u32;
        let ip = d["ip"]
            .as_str()
            .ok_or(StreamError::ProtocolState("READY without ip"))?
            .to_string();
        let port = d["port"]
            .as_u64()
            .ok_or(StreamError::ProtocolState("READY without port"))? as u16;

        let stream = d["streams"].as_array().and_then(|s| s.first());
        let video_ssrc = stream
            .and_then(|s| s["ssrc"].as_u64())
            .map(|s| s as u32)
            .unwrap_or(audio_ssrc.wrapping_add(1));
        let rtx_ssrc = stream
            .and_then(|s| s["rtx_ssrc"].as_u64())
            .map(|s| s as u32)
            .unwrap_or(video_ssrc.wrapping_add(1));

        let modes = d["modes"]
            .as_array()
            .map(|m| {
                m.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            ip,
            port,
            audio_ssrc,
            video_ssrc,
            rtx_ssrc,
            modes,
        })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| StreamError::ProtocolState("READY carried an unparsable endpoint"))
    }
}

/// The negotiated master key and AEAD family from SELECT_PROTOCOL_ACK.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub secret_key: [u8; 32],
    pub mode: CipherMode,
}

impl SessionKeys {
    pub fn from_ack(d: &Value) -> Result<Self> {
        let mode_name = d["mode"]
            .as_str()
            .ok_or(StreamError::ProtocolState("SELECT_PROTOCOL_ACK without mode"))?;
        let mode = CipherMode::from_wire(mode_name).ok_or_else(|| {
            StreamError::Crypto(format!("server selected unknown mode '{mode_name}'"))
        })?;

        let key_array = d["secret_key"]
            .as_array()
            .ok_or(StreamError::ProtocolState("SELECT_PROTOCOL_ACK without key"))?;
        if key_array.len() < 32 {
            return Err(StreamError::Crypto(format!(
                "secret_key has {} bytes, expected 32",
                key_array.len()
            )));
        }
        let mut secret_key = [0u8; 32];
        for (i, v) in key_array.iter().enumerate().take(32) {
            secret_key[i] = v.as_u64().unwrap_or(0) as u8;
        }
        Ok(Self { secret_key, mode })
    }
}

/// The codec catalog advertised in SELECT_PROTOCOL: every supported pair
/// at priority 1000.
pub fn codec_catalog() -> Value {
    let mut catalog = vec![json!({
        "name": "opus",
        "type": "audio",
        "priority": 1000,
        "payload_type": OPUS_PAYLOAD_TYPE,
    })];
    for codec in [
        VideoCodec::H264,
        VideoCodec::H265,
        VideoCodec::VP8,
        VideoCodec::VP9,
        VideoCodec::AV1,
    ] {
        catalog.push(json!({
            "name": codec.wire_name(),
            "type": "video",
            "priority": 1000,
            "payload_type": codec.payload_type(),
            "rtx_payload_type": codec.rtx_payload_type(),
            "encode": true,
            "decode": true,
        }));
    }
    Value::Array(catalog)
}

/// The VIDEO opcode payload: one simulcast descriptor at full quality, or
/// zeroed SSRCs when video is being disabled.
pub fn video_status_payload(
    params: &WebRtcParameters,
    options: &StreamOptions,
    active: bool,
) -> Value {
    if !active {
        return json!({
            "audio_ssrc": params.audio_ssrc,
            "video_ssrc": 0,
            "rtx_ssrc": 0,
            "streams": [],
        });
    }
    json!({
        "audio_ssrc": params.audio_ssrc,
        "video_ssrc": params.video_ssrc,
        "rtx_ssrc": params.rtx_ssrc,
        "streams": [{
            "type": "video",
            "rid": "100",
            "quality": 100,
            "active": true,
            "ssrc": params.video_ssrc,
            "rtx_ssrc": params.rtx_ssrc,
            "max_bitrate": options.max_bitrate_kbps * 1000,
            "max_framerate": options.fps,
            "max_resolution": {
                "type": "fixed",
                "width": options.width,
                "height": options.height,
            },
        }],
    })
}
