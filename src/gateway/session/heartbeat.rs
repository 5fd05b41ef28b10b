use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio_tungstenite::tungstenite::protocol::Message;

use crate::gateway::constants::{HEARTBEAT_NONCE, OP_HEARTBEAT};
use crate::gateway::session::types::VoiceGatewayMessage;

/// Current wall time in unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sends the fixed-nonce heartbeat every `interval_ms` until the writer
/// channel closes. The send time lands in `last_heartbeat` so the ACK
/// handler can compute the round trip.
pub fn spawn_heartbeat(
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    last_heartbeat: Arc<AtomicU64>,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; the server expects the first
        // heartbeat only after one full interval
        interval.tick().await;
        loop {
            interval.tick().await;
            last_heartbeat.store(now_ms(), Ordering::Relaxed);

            let hb = VoiceGatewayMessage {
                op: OP_HEARTBEAT,
                d: serde_json::json!(HEARTBEAT_NONCE),
            };
            let Ok(json) = serde_json::to_string(&hb) else {
                break;
            };
            if tx.send(Message::Text(json.into())).is_err() {
                break; // channel closed, session ending
            }
        }
    })
}
