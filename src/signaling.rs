//! Control-plane signaling semantics.
//!
//! The crate does not own a main-gateway transport; the host forwards the
//! four inbound dispatch kinds as [`SignalEvent`]s and ships each outbound
//! [`GatewayCommand`] payload over its own gateway connection.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Inbound dispatches the controller consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalEvent {
    VoiceStateUpdate {
        user_id: String,
        session_id: String,
    },
    VoiceServerUpdate {
        guild_id: String,
        endpoint: String,
        token: String,
    },
    StreamCreate {
        stream_key: String,
        rtc_server_id: String,
    },
    StreamServerUpdate {
        stream_key: String,
        endpoint: String,
        token: String,
    },
}

/// A Go-Live stream identifier: `guild:<guild_id>:<channel_id>:<user_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub guild_id: String,
    pub channel_id: String,
    pub user_id: String,
}

impl StreamKey {
    pub fn new(
        guild_id: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "guild:{}:{}:{}",
            self.guild_id, self.channel_id, self.user_id
        )
    }
}

impl std::str::FromStr for StreamKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("guild"), Some(g), Some(c), Some(u), None) => {
                Ok(StreamKey::new(g, c, u))
            }
            _ => Err(format!("malformed stream key '{s}'")),
        }
    }
}

/// Outbound main-gateway commands with their dispatch payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    /// Join (or update) the voice channel; `self_video` signals camera mode.
    JoinVoice {
        guild_id: String,
        channel_id: String,
        self_video: bool,
    },
    /// Leave voice entirely.
    LeaveVoice,
    /// Open a Go-Live stream in the current channel.
    CreateStream {
        guild_id: String,
        channel_id: String,
    },
    SetStreamPaused {
        stream_key: String,
        paused: bool,
    },
    DeleteStream {
        stream_key: String,
    },
}

impl GatewayCommand {
    /// The gateway dispatch name this payload travels under.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayCommand::JoinVoice { .. } | GatewayCommand::LeaveVoice => "VOICE_STATE_UPDATE",
            GatewayCommand::CreateStream { .. } => "STREAM_CREATE",
            GatewayCommand::SetStreamPaused { .. } => "STREAM_SET_PAUSED",
            GatewayCommand::DeleteStream { .. } => "STREAM_DELETE",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            GatewayCommand::JoinVoice {
                guild_id,
                channel_id,
                self_video,
            } => json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": false,
                "self_deaf": true,
                "self_video": self_video,
            }),
            GatewayCommand::LeaveVoice => json!({
                "guild_id": null,
                "channel_id": null,
                "self_mute": true,
                "self_deaf": false,
                "self_video": false,
            }),
            GatewayCommand::CreateStream {
                guild_id,
                channel_id,
            } => json!({
                "type": "guild",
                "guild_id": guild_id,
                "channel_id": channel_id,
                "preferred_region": null,
            }),
            GatewayCommand::SetStreamPaused { stream_key, paused } => json!({
                "stream_key": stream_key,
                "paused": paused,
            }),
            GatewayCommand::DeleteStream { stream_key } => json!({
                "stream_key": stream_key,
            }),
        }
    }
}
