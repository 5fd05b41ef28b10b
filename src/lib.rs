//! # riptide
//!
//! A media transport engine for Discord voice and Go-Live sessions.
//!
//! The crate negotiates a voice session over the voice gateway, IP-discovers
//! its public address over UDP, selects an SRTP AEAD profile, and then
//! packetizes, paces, encrypts and transmits encoded Opus and H.264/H.265/VP8
//! frames in real time with A/V synchronization.
//!
//! The demuxer/encoder and the main-gateway transport stay outside: the host
//! feeds [`media::EncodedPacket`]s into the controller's sinks, forwards
//! inbound dispatches as [`signaling::SignalEvent`]s and ships outbound
//! [`signaling::GatewayCommand`]s over its own gateway connection.
//!
//! ```no_run
//! use riptide::{StreamController, StreamOptions};
//!
//! # async fn example() -> riptide::Result<()> {
//! let (controller, mut commands, mut events) =
//!     StreamController::new("user-id", StreamOptions::default());
//!
//! // wire `commands`/`events` to the gateway connection, then:
//! controller.join_voice("guild-id", "channel-id").await?;
//! controller.start_golive(None).await?;
//!
//! // hand controller.audio_sink() / controller.video_sink() to the demuxer
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod gateway;
pub mod media;
pub mod pacing;
pub mod rtp;
pub mod signaling;
pub mod udp;

pub use common::{Result, StreamError};
pub use config::{StreamOptions, VideoCodec};
pub use controller::{StreamController, StreamEvent};
pub use media::{EncodedPacket, ParameterSets, TimeBase};
pub use signaling::{GatewayCommand, SignalEvent, StreamKey};
