use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::VoiceConnection;
use super::heartbeat::{now_ms, spawn_heartbeat};
use super::types::{SessionKeys, VoiceGatewayMessage, WebRtcParameters, codec_catalog};
use crate::common::errors::Result;
use crate::crypto::CipherMode;
use crate::gateway::constants::{
    OP_HEARTBEAT_ACK, OP_HELLO, OP_READY, OP_RESUMED, OP_SELECT_PROTOCOL, OP_SELECT_PROTOCOL_ACK,
};
use crate::udp::UdpTransport;

/// Per-WebSocket dispatch state. One instance lives for the duration of a
/// single connection attempt; the durable session state (keys, transport,
/// SSRCs) lives in the connection's shared block and survives resumes.
pub struct SessionState<'a> {
    conn: &'a VoiceConnection,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    last_heartbeat: Arc<AtomicU64>,
}

impl<'a> SessionState<'a> {
    pub fn new(
        conn: &'a VoiceConnection,
        tx: tokio::sync::mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            conn,
            tx,
            heartbeat: None,
            last_heartbeat: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Dispatches one inbound frame. Errors are terminal for the session.
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        let msg: VoiceGatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparsable voice gateway frame: {e}");
                return Ok(());
            }
        };

        match msg.op {
            OP_HELLO => self.handle_hello(&msg.d),
            OP_READY => self.handle_ready(&msg.d).await?,
            OP_SELECT_PROTOCOL_ACK => self.handle_select_protocol_ack(&msg.d)?,
            OP_HEARTBEAT_ACK => self.handle_heartbeat_ack(),
            OP_RESUMED => self.handle_resumed(),
            op => debug!("ignoring voice op {op}: {:?}", msg.d),
        }
        Ok(())
    }

    fn handle_hello(&mut self, d: &Value) {
        let interval = d["heartbeat_interval"].as_f64().unwrap_or(30_000.0) as u64;
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        debug!("heartbeat interval {interval} ms");
        self.heartbeat = Some(spawn_heartbeat(
            self.tx.clone(),
            self.last_heartbeat.clone(),
            interval.max(1),
        ));
        self.conn.shared().mark_identified();
    }

    /// READY carries the SSRCs and the peer endpoint. The first READY of a
    /// session triggers IP discovery; the transport then persists across
    /// resumes.
    async fn handle_ready(&mut self, d: &Value) -> Result<()> {
        let params = WebRtcParameters::from_ready(d)?;
        let shared = self.conn.shared();

        let discovered = match shared.discovered() {
            Some(existing) => existing,
            None => {
                let peer = params.peer_addr()?;
                let (udp, discovered) = UdpTransport::connect(peer, params.audio_ssrc).await?;
                debug!(
                    "voice transport ready: {} -> {peer}, audio ssrc {}, video ssrc {}",
                    discovered.ip, params.audio_ssrc, params.video_ssrc
                );
                shared.store_transport(Arc::new(udp), discovered);
                discovered
            }
        };

        let mode = CipherMode::select(
            &params.modes,
            self.conn.options().force_chacha20_encryption,
        );
        shared.store_webrtc(params);

        self.send_json(
            OP_SELECT_PROTOCOL,
            serde_json::json!({
                "protocol": "udp",
                "data": {
                    "address": discovered.ip.to_string(),
                    "port": discovered.port,
                    "mode": mode.wire_name(),
                },
                "codecs": codec_catalog(),
            }),
        );
        Ok(())
    }

    fn handle_select_protocol_ack(&mut self, d: &Value) -> Result<()> {
        let keys = SessionKeys::from_ack(d)?;
        debug!("protocol acknowledged, mode {:?}", keys.mode);
        self.conn.shared().store_keys(keys);
        self.conn.shared().set_operational(true);
        Ok(())
    }

    fn handle_heartbeat_ack(&self) {
        let sent = self.last_heartbeat.load(Ordering::Relaxed);
        if sent > 0 {
            let latency = now_ms().saturating_sub(sent);
            self.conn.shared().record_ping(latency as i64);
        }
    }

    fn handle_resumed(&self) {
        info!("voice session resumed");
        self.conn.shared().set_operational(true);
    }

    fn send_json(&self, op: u8, d: Value) {
        let msg = VoiceGatewayMessage { op, d };
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = self.tx.send(Message::Text(json.into()));
        }
    }
}

impl<'a> Drop for SessionState<'a> {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}
