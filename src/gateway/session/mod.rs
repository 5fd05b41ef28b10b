use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod handler;
pub mod heartbeat;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;

use self::types::{
    SessionKeys, SessionOutcome, VoiceGatewayMessage, WebRtcParameters, is_resumable_close,
    video_status_payload,
};
use crate::common::errors::{Result, StreamError};
use crate::config::StreamOptions;
use crate::gateway::constants::{
    MAX_RESUME_ATTEMPTS, OP_IDENTIFY, OP_RESUME, OP_SPEAKING, OP_VIDEO, VOICE_GATEWAY_VERSION,
    WRITE_TASK_SHUTDOWN_MS,
};
use crate::udp::{DiscoveredAddress, UdpTransport};

/// Session state that survives individual WebSocket connections: the
/// negotiated transport, keys and SSRCs stay put while the control socket
/// resumes around them.
pub struct VoiceShared {
    webrtc: parking_lot::RwLock<Option<WebRtcParameters>>,
    keys: parking_lot::RwLock<Option<SessionKeys>>,
    udp: parking_lot::RwLock<Option<Arc<UdpTransport>>>,
    discovered: parking_lot::RwLock<Option<DiscoveredAddress>>,
    writer: parking_lot::RwLock<Option<tokio::sync::mpsc::UnboundedSender<Message>>>,
    identified: AtomicBool,
    operational: tokio::sync::watch::Sender<bool>,
    closed: tokio::sync::watch::Sender<bool>,
    fault: parking_lot::Mutex<Option<StreamError>>,
    ping_ms: AtomicI64,
}

impl VoiceShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            webrtc: parking_lot::RwLock::new(None),
            keys: parking_lot::RwLock::new(None),
            udp: parking_lot::RwLock::new(None),
            discovered: parking_lot::RwLock::new(None),
            writer: parking_lot::RwLock::new(None),
            identified: AtomicBool::new(false),
            operational: tokio::sync::watch::Sender::new(false),
            closed: tokio::sync::watch::Sender::new(false),
            fault: parking_lot::Mutex::new(None),
            ping_ms: AtomicI64::new(-1),
        })
    }

    pub fn webrtc(&self) -> Option<WebRtcParameters> {
        self.webrtc.read().clone()
    }

    pub fn keys(&self) -> Option<SessionKeys> {
        self.keys.read().clone()
    }

    pub fn udp(&self) -> Option<Arc<UdpTransport>> {
        self.udp.read().clone()
    }

    pub fn discovered(&self) -> Option<DiscoveredAddress> {
        *self.discovered.read()
    }

    pub fn is_operational(&self) -> bool {
        *self.operational.borrow()
    }

    pub fn ping_ms(&self) -> i64 {
        self.ping_ms.load(Ordering::Relaxed)
    }

    fn store_webrtc(&self, params: WebRtcParameters) {
        *self.webrtc.write() = Some(params);
    }

    fn store_keys(&self, keys: SessionKeys) {
        *self.keys.write() = Some(keys);
    }

    fn store_transport(&self, udp: Arc<UdpTransport>, discovered: DiscoveredAddress) {
        *self.udp.write() = Some(udp);
        *self.discovered.write() = Some(discovered);
    }

    fn mark_identified(&self) {
        self.identified.store(true, Ordering::Release);
    }

    fn is_identified(&self) -> bool {
        self.identified.load(Ordering::Acquire)
    }

    fn set_operational(&self, value: bool) {
        self.operational.send_replace(value);
    }

    fn record_ping(&self, ms: i64) {
        self.ping_ms.store(ms, Ordering::Relaxed);
    }

    fn send_message(&self, message: Message) -> Result<()> {
        let writer = self.writer.read();
        let tx = writer
            .as_ref()
            .ok_or(StreamError::ProtocolState("voice gateway is not connected"))?;
        tx.send(message)
            .map_err(|_| StreamError::ProtocolState("voice gateway writer has closed"))
    }
}

// handler.rs reaches back into the shared block through the connection
impl VoiceConnection {
    pub(crate) fn shared(&self) -> &Arc<VoiceShared> {
        &self.shared
    }

    pub(crate) fn options(&self) -> &StreamOptions {
        &self.options
    }
}

/// A voice control connection: one WebSocket state machine driving the
/// session to an operational (sendable) state and keeping it there.
///
/// Used both for the voice channel itself and for the Go-Live sub-session,
/// which is the same protocol keyed by a stream server id.
pub struct VoiceConnection {
    server_id: String,
    user_id: crate::common::types::UserId,
    session_id: crate::common::types::SessionId,
    token: String,
    endpoint: String,
    options: Arc<StreamOptions>,
    shared: Arc<VoiceShared>,
    cancel: CancellationToken,
}

fn gateway_url(endpoint: &str) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        format!("{endpoint}/?v={VOICE_GATEWAY_VERSION}")
    } else {
        format!("wss://{endpoint}/?v={VOICE_GATEWAY_VERSION}")
    }
}

impl VoiceConnection {
    pub fn new(
        server_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        token: impl Into<String>,
        endpoint: impl Into<String>,
        options: Arc<StreamOptions>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            token: token.into(),
            endpoint: endpoint.into(),
            options,
            shared: VoiceShared::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the connection loop and returns its control handle.
    pub fn spawn(self) -> VoiceHandle {
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let options = self.options.clone();

        let run_shared = shared.clone();
        let task = tokio::spawn(async move {
            match self.run().await {
                Ok(()) => {}
                Err(e) => {
                    error!("voice connection failed: {e}");
                    *run_shared.fault.lock() = Some(e);
                }
            }
            run_shared.set_operational(false);
            run_shared.closed.send_replace(true);
        });

        VoiceHandle {
            shared,
            options,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    async fn run(self) -> Result<()> {
        let mut resume_attempts = 0u32;
        let mut resume = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let outcome = self.connect(resume).await?;
            match outcome {
                SessionOutcome::Stopped => return Ok(()),
                SessionOutcome::Resume => {
                    if self.shared.is_operational() {
                        // the previous connection got all the way up; start
                        // counting attempts from zero again
                        resume_attempts = 0;
                    }
                    self.shared.set_operational(false);
                    resume_attempts += 1;
                    if resume_attempts > MAX_RESUME_ATTEMPTS {
                        return Err(StreamError::ControlClose {
                            code: 0,
                            reason: format!(
                                "gave up after {MAX_RESUME_ATTEMPTS} resume attempts"
                            ),
                            resumable: true,
                        });
                    }
                    info!(
                        "voice gateway resuming (attempt {resume_attempts}/{MAX_RESUME_ATTEMPTS})"
                    );
                    resume = true;
                }
            }
        }
    }

    async fn connect(&self, resume: bool) -> Result<SessionOutcome> {
        let url = gateway_url(&self.endpoint);
        debug!("connecting voice gateway: {url}");

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionOutcome::Stopped),
            res = tokio_tungstenite::connect_async(&url) => res,
        };
        let (ws, _) = match connected {
            Ok(ok) => ok,
            Err(e) if resume => {
                warn!("reconnect for resume failed: {e}");
                return Ok(SessionOutcome::Resume);
            }
            Err(e) => return Err(e.into()),
        };
        let (mut write, mut read) = ws.split();

        let opening = if resume {
            VoiceGatewayMessage {
                op: OP_RESUME,
                d: serde_json::json!({
                    "server_id": self.server_id,
                    "session_id": self.session_id,
                    "token": self.token,
                }),
            }
        } else {
            VoiceGatewayMessage {
                op: OP_IDENTIFY,
                d: serde_json::json!({
                    "server_id": self.server_id,
                    "user_id": self.user_id,
                    "session_id": self.session_id,
                    "token": self.token,
                    "video": true,
                }),
            }
        };
        write
            .send(Message::Text(serde_json::to_string(&opening)?.into()))
            .await?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("voice WS write error (expected during reconnect): {e}");
                    break;
                }
            }
        });
        *self.shared.writer.write() = Some(tx.clone());

        let mut state = handler::SessionState::new(self, tx.clone());

        let outcome = loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(SessionOutcome::Stopped),
                msg = read.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = state.handle_text(text.as_str()).await {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match &frame {
                        Some(cf) => (u16::from(cf.code), cf.reason.to_string()),
                        None => (1000u16, String::new()),
                    };
                    info!("voice WS closed: code={code} reason='{reason}'");

                    if is_resumable_close(code) && self.shared.is_identified() {
                        break Ok(SessionOutcome::Resume);
                    }
                    break Err(StreamError::ControlClose {
                        code,
                        reason,
                        resumable: false,
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if self.shared.is_identified() {
                        warn!("voice WS read error: {e}; resuming");
                        break Ok(SessionOutcome::Resume);
                    }
                    break Err(e.into());
                }
                None => {
                    if self.shared.is_identified() {
                        debug!("voice WS stream ended; resuming");
                        break Ok(SessionOutcome::Resume);
                    }
                    break Err(StreamError::ControlClose {
                        code: 1006,
                        reason: "stream ended before identify completed".into(),
                        resumable: false,
                    });
                }
            }
        };

        *self.shared.writer.write() = None;
        drop(tx);
        drop(state);
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(WRITE_TASK_SHUTDOWN_MS),
            write_task,
        )
        .await;

        outcome
    }
}

/// Control surface of a running voice connection.
pub struct VoiceHandle {
    shared: Arc<VoiceShared>,
    options: Arc<StreamOptions>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VoiceHandle {
    /// Resolves once the session reaches the operational state (keys and
    /// transport negotiated), or fails with the connection's fault.
    pub async fn wait_operational(&self) -> Result<()> {
        let mut operational = self.shared.operational.subscribe();
        let mut closed = self.shared.closed.subscribe();
        loop {
            if *operational.borrow() {
                return Ok(());
            }
            if *closed.borrow() {
                return Err(self.take_fault());
            }
            tokio::select! {
                res = operational.changed() => {
                    if res.is_err() {
                        return Err(self.take_fault());
                    }
                }
                _ = closed.changed() => {}
            }
        }
    }

    fn take_fault(&self) -> StreamError {
        self.shared
            .fault
            .lock()
            .take()
            .unwrap_or(StreamError::ProtocolState("voice connection closed"))
    }

    pub fn is_operational(&self) -> bool {
        self.shared.is_operational()
    }

    pub fn webrtc(&self) -> Option<WebRtcParameters> {
        self.shared.webrtc()
    }

    pub fn keys(&self) -> Option<SessionKeys> {
        self.shared.keys()
    }

    pub fn udp(&self) -> Option<Arc<UdpTransport>> {
        self.shared.udp()
    }

    pub fn discovered(&self) -> Option<DiscoveredAddress> {
        self.shared.discovered()
    }

    /// Last measured heartbeat round trip, or -1 before the first ACK.
    pub fn ping_ms(&self) -> i64 {
        self.shared.ping_ms()
    }

    /// Sends the SPEAKING opcode for the session's audio SSRC.
    pub fn set_speaking(&self, speaking: bool) -> Result<()> {
        let params = self
            .shared
            .webrtc()
            .ok_or(StreamError::ProtocolState("no SSRC before READY"))?;
        self.send_op(
            OP_SPEAKING,
            serde_json::json!({
                "speaking": if speaking { 1 } else { 0 },
                "delay": 0,
                "ssrc": params.audio_ssrc,
            }),
        )
    }

    /// Sends the VIDEO opcode; disabling reports zeroed SSRCs.
    pub fn set_video_status(&self, active: bool) -> Result<()> {
        let params = self
            .shared
            .webrtc()
            .ok_or(StreamError::ProtocolState("no SSRC before READY"))?;
        self.send_op(OP_VIDEO, video_status_payload(&params, &self.options, active))
    }

    fn send_op(&self, op: u8, d: serde_json::Value) -> Result<()> {
        let msg = VoiceGatewayMessage { op, d };
        self.shared
            .send_message(Message::Text(serde_json::to_string(&msg)?.into()))
    }

    /// Stops the connection and waits for the loop to wind down. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for VoiceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
