/// Voice gateway version in the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 7;

pub const OP_IDENTIFY: u8 = 0;
pub const OP_SELECT_PROTOCOL: u8 = 1;
pub const OP_READY: u8 = 2;
pub const OP_HEARTBEAT: u8 = 3;
pub const OP_SELECT_PROTOCOL_ACK: u8 = 4;
pub const OP_SPEAKING: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_RESUME: u8 = 7;
pub const OP_HELLO: u8 = 8;
pub const OP_RESUMED: u8 = 9;
pub const OP_VIDEO: u8 = 12;

/// Fixed nonce sent with every heartbeat.
pub const HEARTBEAT_NONCE: u64 = 42069;

/// Maximum consecutive resume attempts before the close is surfaced.
pub const MAX_RESUME_ATTEMPTS: u32 = 5;

/// Timeout (ms) allowed for the WS write task to shut down gracefully.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;
