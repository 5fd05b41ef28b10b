/// Snowflake identifiers, kept as strings the way the gateway carries them.
pub type GuildId = String;
pub type ChannelId = String;
pub type UserId = String;
pub type SessionId = String;

/// The two media kinds a session transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}
