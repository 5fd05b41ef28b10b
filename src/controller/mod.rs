//! Streaming lifecycle orchestration.
//!
//! The controller joins voice, optionally opens the Go-Live sub-session
//! (a second control connection keyed by the stream key), wires the
//! demuxer's output into freshly built pacing streams, and owns
//! pause/resume/stop. It talks to the host's main gateway purely through
//! [`GatewayCommand`]s out and [`SignalEvent`]s in.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::common::errors::{Result, StreamError};
use crate::common::types::{ChannelId, GuildId, MediaKind, SessionId, UserId};
use crate::config::{OPUS_PAYLOAD_TYPE, StreamOptions};
use crate::crypto::TransportCipher;
use crate::gateway::{VoiceConnection, VoiceHandle};
use crate::media::ParameterSets;
use crate::pacing::{PacingHandle, PacingOptions, PacingStream};
use crate::rtp::{Packetizer, RtpStream, RtpStreamSpec};
use crate::signaling::{GatewayCommand, SignalEvent, StreamKey};

/// Settle time after detaching the encoder, letting the transcoder drain.
const TEARDOWN_SETTLE_MS: u64 = 50;

/// Lifecycle notifications for the host.
#[derive(Debug)]
pub enum StreamEvent {
    /// The voice session reached the operational state.
    Connected,
    /// Media streams are wired up and frames are flowing.
    StreamStarted,
    /// The session ended; `stop()` is complete.
    Stopped,
    /// A terminal failure. The session is over.
    Error(StreamError),
}

#[derive(Default)]
struct PendingVoice {
    guild_id: Option<GuildId>,
    channel_id: Option<ChannelId>,
    session_id: Option<SessionId>,
    endpoint: Option<String>,
    token: Option<String>,
}

#[derive(Default)]
struct PendingStream {
    stream_key: Option<String>,
    rtc_server_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
}

#[derive(Default)]
struct ControllerState {
    voice: PendingVoice,
    stream: PendingStream,
}

struct ActiveStreams {
    audio: Arc<PacingHandle>,
    video: Arc<PacingHandle>,
}

/// Orchestrates one user's voice + Go-Live session.
pub struct StreamController {
    user_id: UserId,
    options: Arc<StreamOptions>,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: parking_lot::Mutex<ControllerState>,
    /// Bumped on every inbound signal so waiters can re-check the state.
    signal_rev: tokio::sync::watch::Sender<u64>,
    voice: parking_lot::Mutex<Option<Arc<VoiceHandle>>>,
    live: parking_lot::Mutex<Option<Arc<VoiceHandle>>>,
    streams: parking_lot::Mutex<Option<ActiveStreams>>,
    stopped: AtomicBool,
}

impl StreamController {
    pub fn new(
        user_id: impl Into<String>,
        options: StreamOptions,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<GatewayCommand>,
        mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            user_id: user_id.into(),
            options: Arc::new(options),
            commands: commands_tx,
            events: events_tx,
            state: parking_lot::Mutex::new(ControllerState::default()),
            signal_rev: tokio::sync::watch::Sender::new(0),
            voice: parking_lot::Mutex::new(None),
            live: parking_lot::Mutex::new(None),
            streams: parking_lot::Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        (controller, commands_rx, events_rx)
    }

    /// Feeds one inbound signaling dispatch into the session state.
    pub fn handle_signal(&self, event: SignalEvent) {
        let mut state = self.state.lock();
        match event {
            SignalEvent::VoiceStateUpdate {
                user_id,
                session_id,
            } => {
                if user_id == self.user_id {
                    debug!("voice session id received");
                    state.voice.session_id = Some(session_id);
                }
            }
            SignalEvent::VoiceServerUpdate {
                guild_id,
                endpoint,
                token,
            } => {
                if state.voice.guild_id.as_deref() == Some(guild_id.as_str()) {
                    debug!("voice server update: {endpoint}");
                    state.voice.endpoint = Some(endpoint);
                    state.voice.token = Some(token);
                }
            }
            SignalEvent::StreamCreate {
                stream_key,
                rtc_server_id,
            } => {
                if self.owns_stream_key(&state, &stream_key) {
                    debug!("go-live stream created: {stream_key}");
                    state.stream.stream_key = Some(stream_key);
                    state.stream.rtc_server_id = Some(rtc_server_id);
                }
            }
            SignalEvent::StreamServerUpdate {
                stream_key,
                endpoint,
                token,
            } => {
                if state.stream.stream_key.as_deref() == Some(stream_key.as_str())
                    || self.owns_stream_key(&state, &stream_key)
                {
                    debug!("go-live server update: {endpoint}");
                    state.stream.endpoint = Some(endpoint);
                    state.stream.token = Some(token);
                }
            }
        }
        drop(state);
        self.signal_rev.send_modify(|rev| *rev += 1);
    }

    fn owns_stream_key(&self, state: &ControllerState, key: &str) -> bool {
        let (Some(guild), Some(channel)) =
            (state.voice.guild_id.as_ref(), state.voice.channel_id.as_ref())
        else {
            return false;
        };
        key.parse::<StreamKey>().is_ok_and(|parsed| {
            parsed.guild_id == *guild
                && parsed.channel_id == *channel
                && parsed.user_id == self.user_id
        })
    }

    /// Blocks until `f` extracts a value from the signal-fed state.
    async fn wait_for<T>(&self, f: impl Fn(&ControllerState) -> Option<T>) -> Result<T> {
        let mut rev = self.signal_rev.subscribe();
        loop {
            if let Some(value) = f(&self.state.lock()) {
                return Ok(value);
            }
            rev.changed()
                .await
                .map_err(|_| StreamError::ProtocolState("controller dropped"))?;
        }
    }

    fn send_command(&self, command: GatewayCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::ProtocolState("gateway command channel closed"))
    }

    /// Joins the voice channel and brings the voice control connection to
    /// the operational state.
    pub async fn join_voice(
        &self,
        guild_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Result<()> {
        let guild_id = guild_id.into();
        let channel_id = channel_id.into();
        {
            let mut state = self.state.lock();
            state.voice.guild_id = Some(guild_id.clone());
            state.voice.channel_id = Some(channel_id.clone());
        }
        self.send_command(GatewayCommand::JoinVoice {
            guild_id: guild_id.clone(),
            channel_id,
            self_video: false,
        })?;

        let (session_id, endpoint, token) = self
            .wait_for(|state| {
                Some((
                    state.voice.session_id.clone()?,
                    state.voice.endpoint.clone()?,
                    state.voice.token.clone()?,
                ))
            })
            .await?;

        let connection = VoiceConnection::new(
            guild_id,
            self.user_id.clone(),
            session_id,
            token,
            endpoint,
            self.options.clone(),
        );
        let handle = Arc::new(connection.spawn());
        *self.voice.lock() = Some(handle.clone());

        handle.wait_operational().await?;
        info!("voice session operational");
        let _ = self.events.send(StreamEvent::Connected);
        Ok(())
    }

    /// Opens a Go-Live sub-session and wires media streams onto its own
    /// transport. Returns once frames can be fed.
    pub async fn start_golive(&self, params: Option<&ParameterSets>) -> Result<()> {
        let voice = self
            .voice
            .lock()
            .clone()
            .ok_or_else(|| StreamError::Config("no voice connection before streaming".into()))?;
        if !voice.is_operational() {
            return Err(StreamError::Config(
                "voice connection is not operational".into(),
            ));
        }

        let (guild_id, channel_id, session_id) = {
            let state = self.state.lock();
            (
                state.voice.guild_id.clone(),
                state.voice.channel_id.clone(),
                state.voice.session_id.clone(),
            )
        };
        let (Some(guild_id), Some(channel_id), Some(session_id)) =
            (guild_id, channel_id, session_id)
        else {
            return Err(StreamError::ProtocolState("voice session not established"));
        };

        self.send_command(GatewayCommand::CreateStream {
            guild_id: guild_id.clone(),
            channel_id: channel_id.clone(),
        })?;

        let (stream_key, rtc_server_id) = self
            .wait_for(|state| {
                Some((
                    state.stream.stream_key.clone()?,
                    state.stream.rtc_server_id.clone()?,
                ))
            })
            .await?;
        let (endpoint, token) = self
            .wait_for(|state| {
                Some((
                    state.stream.endpoint.clone()?,
                    state.stream.token.clone()?,
                ))
            })
            .await?;

        let connection = VoiceConnection::new(
            rtc_server_id,
            self.user_id.clone(),
            session_id,
            token,
            endpoint,
            self.options.clone(),
        );
        let live = Arc::new(connection.spawn());
        *self.live.lock() = Some(live.clone());
        live.wait_operational().await?;

        self.send_command(GatewayCommand::SetStreamPaused {
            stream_key,
            paused: false,
        })?;

        live.set_speaking(true)?;
        live.set_video_status(true)?;
        self.build_streams(&live, params)?;
        info!("go-live stream started");
        let _ = self.events.send(StreamEvent::StreamStarted);
        Ok(())
    }

    /// Camera mode: streams over the voice channel's own transport instead
    /// of a Go-Live sub-session.
    pub async fn start_camera(&self, params: Option<&ParameterSets>) -> Result<()> {
        let voice = self
            .voice
            .lock()
            .clone()
            .ok_or_else(|| StreamError::Config("no voice connection before streaming".into()))?;
        voice.wait_operational().await?;

        voice.set_speaking(true)?;
        voice.set_video_status(true)?;
        self.build_streams(&voice, params)?;
        let _ = self.events.send(StreamEvent::StreamStarted);
        Ok(())
    }

    /// Builds packetizers and pacing streams on `conn`'s negotiated
    /// transport.
    fn build_streams(&self, conn: &VoiceHandle, params: Option<&ParameterSets>) -> Result<()> {
        let webrtc = conn
            .webrtc()
            .ok_or(StreamError::ProtocolState("no SSRCs negotiated"))?;
        let keys = conn
            .keys()
            .ok_or(StreamError::ProtocolState("no encryption key negotiated"))?;
        let udp = conn
            .udp()
            .ok_or(StreamError::ProtocolState("no UDP transport"))?;

        let cipher = Arc::new(TransportCipher::new(keys.mode, &keys.secret_key)?);
        let options = &self.options;

        let audio_rtp = RtpStream::new(
            RtpStreamSpec {
                sr_interval: options.audio_sr_interval(),
                sr_enabled: options.rtcp_sender_reports,
                ..RtpStreamSpec::new(webrtc.audio_ssrc, OPUS_PAYLOAD_TYPE, 48_000)
            },
            cipher.clone(),
            udp.clone(),
        );
        let video_rtp = RtpStream::new(
            RtpStreamSpec {
                sr_interval: options.video_sr_interval(),
                sr_enabled: options.rtcp_sender_reports,
                extension: true,
                ..RtpStreamSpec::new(
                    webrtc.video_ssrc,
                    options.video_codec.payload_type(),
                    90_000,
                )
            },
            cipher.clone(),
            udp,
        );

        let audio_packetizer = Packetizer::opus(audio_rtp);
        let video_packetizer = Packetizer::video(options.video_codec, video_rtp, params)?;

        let video_frametime = 1000.0 / options.fps.max(1) as f64;
        let mut audio = PacingStream::new(
            MediaKind::Audio,
            audio_packetizer,
            PacingOptions {
                default_frametime_ms: 20.0,
                // the video stream does the sleeping for the pair
                sleep: false,
                ..Default::default()
            },
        );
        let mut video = PacingStream::new(
            MediaKind::Video,
            video_packetizer,
            PacingOptions {
                default_frametime_ms: video_frametime,
                ..Default::default()
            },
        );
        PacingStream::link(&mut audio, &mut video);

        // terminal pacing failures surface as session errors
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        audio.on_error(error_tx.clone());
        video.on_error(error_tx);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(err) = error_rx.recv().await {
                let _ = events.send(StreamEvent::Error(err));
            }
        });

        *self.streams.lock() = Some(ActiveStreams {
            audio: Arc::new(audio.spawn()),
            video: Arc::new(video.spawn()),
        });
        Ok(())
    }

    /// Sink for demuxed audio packets, once streaming has started.
    pub fn audio_sink(&self) -> Option<Arc<PacingHandle>> {
        self.streams.lock().as_ref().map(|s| s.audio.clone())
    }

    /// Sink for demuxed video packets, once streaming has started.
    pub fn video_sink(&self) -> Option<Arc<PacingHandle>> {
        self.streams.lock().as_ref().map(|s| s.video.clone())
    }

    /// Freezes both pacing streams in place.
    pub fn pause(&self) {
        if let Some(streams) = self.streams.lock().as_ref() {
            streams.audio.pause();
            streams.video.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(streams) = self.streams.lock().as_ref() {
            streams.audio.resume();
            streams.video.resume();
        }
    }

    /// Reports the external transcoder's exit. SIGKILL is the expected
    /// teardown signal and is filtered out.
    pub fn notify_encoder_exit(&self, code: Option<i32>, signal: Option<i32>) {
        const SIGKILL: i32 = 9;
        if signal == Some(SIGKILL) || code == Some(0) {
            return;
        }
        let description = match (code, signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown cause".to_string(),
        };
        let _ = self
            .events
            .send(StreamEvent::Error(StreamError::Encoder(description)));
    }

    /// Sends the gateway command that leaves the voice channel.
    pub fn leave_voice(&self) -> Result<()> {
        self.send_command(GatewayCommand::LeaveVoice)
    }

    /// Tears the whole session down. Idempotent: detaches pacing streams,
    /// lets the transcoder drain, clears speaking/video status, deletes the
    /// Go-Live stream and closes both control connections with their UDP
    /// sockets.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let streams = self.streams.lock().take();
        if let Some(streams) = streams {
            streams.audio.stop();
            streams.video.stop();
        }
        tokio::time::sleep(std::time::Duration::from_millis(TEARDOWN_SETTLE_MS)).await;

        let voice = self.voice.lock().take();
        let live = self.live.lock().take();

        if let Some(live) = &live {
            if let Err(e) = live
                .set_speaking(false)
                .and_then(|()| live.set_video_status(false))
            {
                debug!("clearing live status during stop: {e}");
            }
        }
        if let Some(voice) = &voice {
            if let Err(e) = voice.set_speaking(false) {
                debug!("clearing speaking during stop: {e}");
            }
        }

        let stream_key = self.state.lock().stream.stream_key.clone();
        if let Some(stream_key) = stream_key {
            if self
                .send_command(GatewayCommand::DeleteStream { stream_key })
                .is_err()
            {
                warn!("gateway command channel closed before STREAM_DELETE");
            }
        }

        if let Some(live) = live {
            live.stop().await;
        }
        if let Some(voice) = voice {
            voice.stop().await;
        }

        let _ = self.events.send(StreamEvent::Stopped);
        info!("streaming session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoCodec;
    use crate::gateway::session::test_support::{FakeVoiceServer, handshake};
    use crate::media::{EncodedPacket, TimeBase};

    fn controller_options() -> StreamOptions {
        StreamOptions {
            video_codec: VideoCodec::VP8,
            fps: 25,
            ..Default::default()
        }
    }

    /// Answers every outbound command with the inbound signals a real
    /// gateway would deliver.
    fn spawn_signal_driver(
        controller: Arc<StreamController>,
        mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
        voice_endpoint: String,
        live_endpoint: String,
    ) {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    GatewayCommand::JoinVoice { guild_id, .. } => {
                        controller.handle_signal(SignalEvent::VoiceStateUpdate {
                            user_id: "user-1".into(),
                            session_id: "sess-9".into(),
                        });
                        controller.handle_signal(SignalEvent::VoiceServerUpdate {
                            guild_id,
                            endpoint: voice_endpoint.clone(),
                            token: "tok-voice".into(),
                        });
                    }
                    GatewayCommand::CreateStream {
                        guild_id,
                        channel_id,
                    } => {
                        let key = StreamKey::new(guild_id, channel_id, "user-1").to_string();
                        controller.handle_signal(SignalEvent::StreamCreate {
                            stream_key: key.clone(),
                            rtc_server_id: "rtc-7".into(),
                        });
                        controller.handle_signal(SignalEvent::StreamServerUpdate {
                            stream_key: key,
                            endpoint: live_endpoint.clone(),
                            token: "tok-live".into(),
                        });
                    }
                    _ => {}
                }
            }
        });
    }

    fn audio_packet(pts_ms: u32) -> EncodedPacket {
        EncodedPacket {
            kind: MediaKind::Audio,
            data: vec![0x0F; 60],
            pts_hi: 0,
            pts_lo: pts_ms,
            time_base: TimeBase::MILLIS,
            duration: 20,
            keyframe: false,
        }
    }

    fn video_packet(pts_ms: u32) -> EncodedPacket {
        EncodedPacket {
            kind: MediaKind::Video,
            data: vec![0x9D; 120],
            pts_hi: 0,
            pts_lo: pts_ms,
            time_base: TimeBase::MILLIS,
            duration: 40,
            keyframe: true,
        }
    }

    #[tokio::test]
    async fn golive_end_to_end() {
        let voice_server = FakeVoiceServer::start().await;
        let live_server = FakeVoiceServer::start().await;
        let (controller, commands, mut events) =
            StreamController::new("user-1", controller_options());
        spawn_signal_driver(
            controller.clone(),
            commands,
            voice_server.endpoint(),
            live_server.endpoint(),
        );

        let voice_ws = tokio::spawn(async move {
            let ws = handshake(&voice_server, "g1", "tok-voice").await;
            (voice_server, ws)
        });
        controller.join_voice("g1", "c1").await.unwrap();
        let (_voice_server, _voice_ws) = voice_ws.await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(StreamEvent::Connected)
        ));

        let live_ws = tokio::spawn(async move {
            let ws = handshake(&live_server, "rtc-7", "tok-live").await;
            (live_server, ws)
        });
        controller.start_golive(None).await.unwrap();
        let (live_server, _live_ws) = live_ws.await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(StreamEvent::StreamStarted)
        ));

        // feed one video and one audio frame; both come out as SRTP on the
        // go-live transport
        let video = controller.video_sink().unwrap();
        let audio = controller.audio_sink().unwrap();
        video.send(video_packet(0)).await.unwrap();
        audio.send(audio_packet(0)).await.unwrap();

        let mut payload_types = std::collections::HashSet::new();
        for _ in 0..2 {
            let packet = live_server.recv_rtp().await;
            payload_types.insert(packet[1] & 0x7F);
        }
        assert!(payload_types.contains(&105), "expected VP8 packets");
        assert!(payload_types.contains(&120), "expected Opus packets");

        controller.stop().await;
        loop {
            match events.recv().await {
                Some(StreamEvent::Stopped) => break,
                Some(_) => {}
                None => panic!("event channel closed before Stopped"),
            }
        }
        // stop is idempotent
        controller.stop().await;
    }

    #[tokio::test]
    async fn golive_requires_voice_connection() {
        let (controller, _commands, _events) =
            StreamController::new("user-1", controller_options());
        let err = controller.start_golive(None).await.unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[tokio::test]
    async fn signals_for_other_users_are_ignored() {
        let (controller, _commands, _events) =
            StreamController::new("user-1", controller_options());
        controller.handle_signal(SignalEvent::VoiceStateUpdate {
            user_id: "someone-else".into(),
            session_id: "their-session".into(),
        });
        assert!(controller.state.lock().voice.session_id.is_none());
    }

    #[tokio::test]
    async fn encoder_exit_filtering() {
        let (controller, _commands, mut events) =
            StreamController::new("user-1", controller_options());

        // SIGKILL during teardown and clean exits are expected
        controller.notify_encoder_exit(None, Some(9));
        controller.notify_encoder_exit(Some(0), None);
        assert!(events.try_recv().is_err());

        controller.notify_encoder_exit(Some(1), None);
        assert!(matches!(
            events.try_recv(),
            Ok(StreamEvent::Error(StreamError::Encoder(_)))
        ));
    }

    #[tokio::test]
    async fn pause_and_resume_reach_both_streams() {
        let voice_server = FakeVoiceServer::start().await;
        let live_server = FakeVoiceServer::start().await;
        let (controller, commands, _events) =
            StreamController::new("user-1", controller_options());
        spawn_signal_driver(
            controller.clone(),
            commands,
            voice_server.endpoint(),
            live_server.endpoint(),
        );

        let voice_ws = tokio::spawn(async move {
            let ws = handshake(&voice_server, "g1", "tok-voice").await;
            (voice_server, ws)
        });
        controller.join_voice("g1", "c1").await.unwrap();
        voice_ws.await.unwrap();

        let live_ws = tokio::spawn(async move {
            let ws = handshake(&live_server, "rtc-7", "tok-live").await;
            (live_server, ws)
        });
        controller.start_golive(None).await.unwrap();
        live_ws.await.unwrap();

        controller.pause();
        assert!(controller.audio_sink().unwrap().is_paused());
        assert!(controller.video_sink().unwrap().is_paused());
        controller.resume();
        assert!(!controller.audio_sink().unwrap().is_paused());
        assert!(!controller.video_sink().unwrap().is_paused());

        controller.stop().await;
    }
}
