//! Real-time frame pacing.
//!
//! A pacing stream consumes encoded packets in decode order and releases
//! them to its packetizer at wall-clock-correct times. Video and audio
//! streams are paired through non-owning sync handles: the stream that runs
//! ahead of its peer's last-emitted PTS beyond the tolerance blocks in
//! 1 ms polls, which also throttles its producer through the 1-slot input
//! queue.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::common::errors::{Result, StreamError};
use crate::common::types::MediaKind;
use crate::media::EncodedPacket;
use crate::rtp::Packetizer;

/// Poll period while paused.
const PAUSE_POLL: Duration = Duration::from_millis(50);
/// Poll period while waiting for the sync peer.
const SYNC_POLL: Duration = Duration::from_millis(1);

/// Sentinel bits meaning "no PTS recorded yet".
const PTS_UNSET: u64 = u64::MAX;

/// Last-emitted PTS and liveness of one pacing stream, shared with its
/// peer as a plain relation rather than ownership.
pub struct SyncState {
    pts_bits: AtomicU64,
    ended: AtomicBool,
}

impl SyncState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pts_bits: AtomicU64::new(PTS_UNSET),
            ended: AtomicBool::new(false),
        })
    }

    /// PTS of the most recently emitted frame, in milliseconds.
    pub fn pts_ms(&self) -> Option<f64> {
        let bits = self.pts_bits.load(Ordering::Acquire);
        if bits == PTS_UNSET {
            None
        } else {
            Some(f64::from_bits(bits))
        }
    }

    pub fn set_pts(&self, pts_ms: f64) {
        self.pts_bits.store(pts_ms.to_bits(), Ordering::Release);
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }
}

/// Wall-clock schedule of one stream.
///
/// Latched on the first forwarded packet; paused time is excluded so the
/// schedule resumes where it left off.
struct PacingClock {
    start: Option<(Instant, f64)>,
    total_paused: Duration,
}

impl PacingClock {
    fn new() -> Self {
        Self {
            start: None,
            total_paused: Duration::ZERO,
        }
    }

    fn latch(&mut self, now: Instant, pts_ms: f64) {
        self.start.get_or_insert((now, pts_ms));
    }

    fn add_paused(&mut self, paused: Duration) {
        self.total_paused += paused;
    }

    /// How long to keep the slot occupied after sending a frame, so the
    /// frame's full playout interval has elapsed on the wall clock before
    /// the next one is released.
    fn release_delay(&self, now: Instant, pts_ms: f64, frametime_ms: f64) -> Duration {
        let Some((start_wall, start_pts)) = self.start else {
            return Duration::ZERO;
        };
        let target_ms = pts_ms - start_pts + frametime_ms;
        let elapsed_ms =
            (now.saturating_duration_since(start_wall) - self.total_paused).as_secs_f64() * 1000.0;
        let delay_ms = target_ms - elapsed_ms;
        if delay_ms <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_ms / 1000.0)
        }
    }
}

/// Tuning for one pacing stream.
#[derive(Debug, Clone)]
pub struct PacingOptions {
    /// Frame duration used when a packet doesn't carry one.
    pub default_frametime_ms: f64,
    /// How far (ms) this stream may run ahead of its sync peer.
    pub sync_tolerance_ms: f64,
    /// Sleep out each frame's playout interval. Disabled only for a stream
    /// that has a sync peer doing the sleeping.
    pub sleep: bool,
}

impl Default for PacingOptions {
    fn default() -> Self {
        Self {
            default_frametime_ms: 20.0,
            sync_tolerance_ms: 5.0,
            sleep: true,
        }
    }
}

/// A pacing stream ready to be spawned onto the runtime.
pub struct PacingStream {
    kind: MediaKind,
    packetizer: Packetizer,
    options: PacingOptions,
    tx: flume::Sender<EncodedPacket>,
    rx: flume::Receiver<EncodedPacket>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    sync: Arc<SyncState>,
    peer: Weak<SyncState>,
    error_tx: Option<tokio::sync::mpsc::UnboundedSender<StreamError>>,
}

impl PacingStream {
    pub fn new(kind: MediaKind, packetizer: Packetizer, options: PacingOptions) -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            kind,
            packetizer,
            options,
            tx,
            rx,
            paused: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            sync: SyncState::new(),
            peer: Weak::new(),
            error_tx: None,
        }
    }

    pub fn sync_state(&self) -> Arc<SyncState> {
        self.sync.clone()
    }

    /// Attaches a sync peer. The reference is weak: when the peer stream
    /// is dropped this stream continues independently.
    pub fn set_peer(&mut self, peer: &Arc<SyncState>) {
        self.peer = Arc::downgrade(peer);
    }

    /// Cross-links two streams as sync peers.
    pub fn link(a: &mut PacingStream, b: &mut PacingStream) {
        let a_sync = a.sync.clone();
        let b_sync = b.sync.clone();
        a.set_peer(&b_sync);
        b.set_peer(&a_sync);
    }

    /// Terminal errors (AEAD failures) are forwarded here before the
    /// stream shuts down.
    pub fn on_error(&mut self, tx: tokio::sync::mpsc::UnboundedSender<StreamError>) {
        self.error_tx = Some(tx);
    }

    pub fn spawn(self) -> PacingHandle {
        let mut handle = PacingHandle {
            kind: self.kind,
            tx: self.tx.clone(),
            paused: self.paused.clone(),
            cancel: self.cancel.clone(),
            sync: self.sync.clone(),
            task: None,
        };
        handle.task = Some(tokio::spawn(self.run()));
        handle
    }

    async fn run(mut self) {
        let mut clock = PacingClock::new();

        'stream: loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break 'stream,
                res = self.rx.recv_async() => match res {
                    Ok(packet) => packet,
                    Err(_) => break 'stream,
                },
            };

            let pts = packet.pts_ms();
            let frametime = packet
                .duration_ms()
                .unwrap_or(self.options.default_frametime_ms);
            clock.latch(Instant::now(), pts);

            // pause gate: poll every 50 ms; the time spent here is excluded
            // from the schedule
            if self.paused.load(Ordering::Acquire) {
                let pause_start = Instant::now();
                while self.paused.load(Ordering::Acquire) {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break 'stream,
                        _ = tokio::time::sleep(PAUSE_POLL) => {}
                    }
                }
                clock.add_paused(pause_start.elapsed());
            }

            // hold while we are ahead of a live peer with a known position
            loop {
                let Some(peer) = self.peer.upgrade() else { break };
                if peer.ended() {
                    break;
                }
                let Some(peer_pts) = peer.pts_ms() else { break };
                if pts - peer_pts <= self.options.sync_tolerance_ms {
                    break;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'stream,
                    _ = tokio::time::sleep(SYNC_POLL) => {}
                }
            }

            let send_start = Instant::now();
            match self.packetizer.send_frame(&packet.data, frametime).await {
                Ok(()) => {}
                Err(err @ StreamError::Crypto(_)) => {
                    error!("{} stream encryption failure: {err}", self.kind);
                    if let Some(tx) = &self.error_tx {
                        let _ = tx.send(err);
                    }
                    break 'stream;
                }
                Err(err) => {
                    // sparse loss is acceptable; keep releasing frames
                    warn!("{} frame send failed: {err}", self.kind);
                }
            }
            let cost_ms = send_start.elapsed().as_secs_f64() * 1000.0;
            if cost_ms > frametime {
                debug!(
                    "{} frame send took {cost_ms:.1} ms (frame time {frametime:.1} ms)",
                    self.kind
                );
            }

            self.sync.set_pts(pts);

            if self.options.sleep {
                let delay = clock.release_delay(Instant::now(), pts, frametime);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break 'stream,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.sync.mark_ended();
        debug!("{} pacing stream terminated", self.kind);
    }
}

/// Control surface of a running pacing stream.
pub struct PacingHandle {
    kind: MediaKind,
    tx: flume::Sender<EncodedPacket>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    sync: Arc<SyncState>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PacingHandle {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Queues one packet. The queue holds a single slot, so the caller is
    /// throttled to the stream's real-time consumption rate.
    pub async fn send(&self, packet: EncodedPacket) -> Result<()> {
        self.tx
            .send_async(packet)
            .await
            .map_err(|_| StreamError::ProtocolState("pacing stream has terminated"))
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn sync_state(&self) -> &Arc<SyncState> {
        &self.sync
    }

    /// Unblocks any pending sleep or sync wait and ends the stream.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stops the stream and waits for its task to wind down.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PacingHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
