//! Base RTP stream state and SRTP packet assembly.
//!
//! Each media stream owns one `RtpStream`: sequence/timestamp counters, the
//! 12-byte header (plus the one-byte extension on video), AEAD encryption
//! of the payload with the header as associated data, and periodic RTCP
//! Sender Reports on the same SRTP framing.

use std::sync::Arc;
use std::time::SystemTime;

use crate::common::errors::Result;
use crate::crypto::TransportCipher;
use crate::udp::UdpTransport;

/// Default RTP payload budget per packet.
pub const DEFAULT_MTU: usize = 1200;

const RTP_VERSION_2: u8 = 0x80;
const RTP_EXTENSION_FLAG: u8 = 0x10;
const RTP_MARKER_FLAG: u8 = 0x80;
const RTP_HEADER_LEN: usize = 12;

/// One-byte extension profile per RFC 8285.
const ONE_BYTE_EXT_PROFILE: [u8; 2] = [0xBE, 0xDE];
/// Extension id of the playout-delay element.
const PLAYOUT_DELAY_EXT_ID: u8 = 5;

const RTCP_SENDER_REPORT: u8 = 0xC8;
const RTCP_HEADER_LEN: usize = 8;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Construction parameters for an [`RtpStream`].
#[derive(Debug, Clone, Copy)]
pub struct RtpStreamSpec {
    pub ssrc: u32,
    pub payload_type: u8,
    /// RTP clock rate in Hz (48 000 for Opus, 90 000 for video).
    pub clock_rate: u32,
    /// Emit an RTCP Sender Report every `sr_interval` packets.
    pub sr_interval: u64,
    pub sr_enabled: bool,
    /// Attach the one-byte playout-delay extension (video streams only;
    /// audio headers carry X=0).
    pub extension: bool,
    pub mtu: usize,
    pub initial_sequence: u16,
}

impl RtpStreamSpec {
    pub fn new(ssrc: u32, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            ssrc,
            payload_type,
            clock_rate,
            sr_interval: 250,
            sr_enabled: true,
            extension: false,
            mtu: DEFAULT_MTU,
            initial_sequence: 0,
        }
    }
}

/// Per-SSRC RTP state plus the shared cipher and socket.
pub struct RtpStream {
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    sequence: u16,
    timestamp: u32,
    total_packets: u64,
    /// Payload octet count, wrapping at 2^32 like the RTCP-SR field.
    total_bytes: u32,
    /// Packet count recorded at the last Sender Report.
    prev_packets_at_sr: u64,
    last_packet_time: SystemTime,
    sr_interval: u64,
    sr_enabled: bool,
    extension: bool,
    mtu: usize,
    cipher: Arc<TransportCipher>,
    udp: Arc<UdpTransport>,
}

impl RtpStream {
    pub fn new(spec: RtpStreamSpec, cipher: Arc<TransportCipher>, udp: Arc<UdpTransport>) -> Self {
        Self {
            ssrc: spec.ssrc,
            payload_type: spec.payload_type,
            clock_rate: spec.clock_rate,
            sequence: spec.initial_sequence,
            timestamp: 0,
            total_packets: 0,
            total_bytes: 0,
            prev_packets_at_sr: 0,
            last_packet_time: SystemTime::now(),
            sr_interval: spec.sr_interval.max(1),
            sr_enabled: spec.sr_enabled,
            extension: spec.extension,
            mtu: spec.mtu,
            cipher,
            udp,
        }
    }

    /// Maximum RTP payload bytes per packet, before codec headers.
    pub fn max_payload(&self) -> usize {
        self.mtu
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_bytes
    }

    /// Assembles, encrypts and sends one RTP packet carrying `payload`.
    ///
    /// The wire format is `header ‖ ciphertext‖tag ‖ nonce[..4]` where the
    /// whole header (including the extension words) is the AAD.
    pub async fn send_packet(&mut self, payload: &[u8], marker: bool) -> Result<()> {
        let header = self.build_header(marker);
        let sealed = self.cipher.encrypt(payload, &header)?;

        let mut packet = Vec::with_capacity(header.len() + sealed.ciphertext.len() + 4);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed.ciphertext);
        packet.extend_from_slice(&sealed.nonce_suffix());
        self.udp.send(&packet).await?;

        self.total_packets += 1;
        self.total_bytes = self.total_bytes.wrapping_add(payload.len() as u32);
        self.last_packet_time = SystemTime::now();

        if self.sr_enabled
            && self.total_packets / self.sr_interval > self.prev_packets_at_sr / self.sr_interval
        {
            self.prev_packets_at_sr = self.total_packets;
            self.send_sender_report().await?;
        }
        Ok(())
    }

    /// Advances the RTP timestamp by one frame of `frametime_ms`.
    pub fn advance_timestamp(&mut self, frametime_ms: f64) {
        let units = (frametime_ms * self.clock_rate as f64 / 1000.0).round() as u32;
        self.timestamp = self.timestamp.wrapping_add(units);
    }

    fn build_header(&mut self, marker: bool) -> Vec<u8> {
        let mut header = Vec::with_capacity(RTP_HEADER_LEN + 8);

        let mut b0 = RTP_VERSION_2;
        if self.extension {
            b0 |= RTP_EXTENSION_FLAG;
        }
        let mut b1 = self.payload_type;
        if marker {
            b1 |= RTP_MARKER_FLAG;
        }
        header.push(b0);
        header.push(b1);
        header.extend_from_slice(&self.sequence.to_be_bytes());
        header.extend_from_slice(&self.timestamp.to_be_bytes());
        header.extend_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);

        if self.extension {
            header.extend_from_slice(&ONE_BYTE_EXT_PROFILE);
            // one extension, one 32-bit word
            header.extend_from_slice(&1u16.to_be_bytes());
            // playout-delay, 2-byte payload MIN=MAX=0, padded to the word
            header.push((PLAYOUT_DELAY_EXT_ID << 4) | 0x01);
            header.extend_from_slice(&[0x00, 0x00, 0x00]);
        }
        header
    }

    /// Emits one SRTP-protected RTCP Sender Report.
    async fn send_sender_report(&mut self) -> Result<()> {
        let mut header = [0u8; RTCP_HEADER_LEN];
        header[0] = 0x80;
        header[1] = RTCP_SENDER_REPORT;
        header[2..4].copy_from_slice(&6u16.to_be_bytes());
        header[4..8].copy_from_slice(&self.ssrc.to_be_bytes());

        let (ntp_msw, ntp_lsw) = ntp_timestamp(self.last_packet_time);
        let mut body = [0u8; 20];
        body[0..4].copy_from_slice(&ntp_msw.to_be_bytes());
        body[4..8].copy_from_slice(&ntp_lsw.to_be_bytes());
        body[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        body[12..16].copy_from_slice(&((self.total_packets as u32).to_be_bytes()));
        body[16..20].copy_from_slice(&self.total_bytes.to_be_bytes());

        let sealed = self.cipher.encrypt(&body, &header)?;
        let mut packet = Vec::with_capacity(header.len() + sealed.ciphertext.len() + 4);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed.ciphertext);
        packet.extend_from_slice(&sealed.nonce_suffix());
        self.udp.send(&packet).await
    }
}

/// Wall time as a 32.32 fixed-point NTP timestamp (seconds since 1900).
fn ntp_timestamp(time: SystemTime) -> (u32, u32) {
    let since_unix = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let msw = (since_unix.as_secs() + NTP_UNIX_OFFSET_SECS) as u32;
    let frac = (since_unix.subsec_nanos() as u128) << 32;
    let lsw = ((frac + 500_000_000) / 1_000_000_000) as u32;
    (msw, lsw)
}
