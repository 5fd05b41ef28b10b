use thiserror::Error;

/// Errors surfaced by the streaming engine.
///
/// Every failure funnels into one of these categories. Resumable control
/// closes are handled inside the voice connection's run loop and never reach
/// the caller; everything that does reach the caller terminates the session.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Invalid or unsupported configuration (unknown codec, streaming
    /// before a voice connection exists, input without a video track).
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation ran before the session state it needs was established
    /// (e.g. sending frames before SSRC, keys or peer endpoint are known).
    #[error("protocol state: {0}")]
    ProtocolState(&'static str),

    /// The UDP IP-discovery handshake failed or produced a malformed reply.
    #[error("ip discovery failed: {0}")]
    Handshake(String),

    /// The voice WebSocket closed. `resumable` is decided by the close code
    /// and how far the session had progressed; resumable closes are retried
    /// internally and only reported here once retries are exhausted.
    #[error("voice gateway closed with code {code} ({reason})")]
    ControlClose {
        code: u16,
        reason: String,
        resumable: bool,
    },

    /// AEAD key import or authentication failure. Always terminal.
    #[error("transport encryption failed: {0}")]
    Crypto(String),

    /// Malformed codec configuration data (avcC/hvcC extradata with an
    /// unexpected configuration version) or an unsupported demuxed codec.
    #[error("codec error: {0}")]
    Codec(String),

    /// The external transcoder exited abnormally. SIGKILL during teardown
    /// is expected and filtered before this is ever constructed.
    #[error("encoder exited abnormally: {0}")]
    Encoder(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::WebSocket(Box::new(e))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StreamError>;
