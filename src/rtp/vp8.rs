//! VP8 packetizer.
//!
//! Every payload opens with the two-byte descriptor (X and I set) followed
//! by the 16-bit PictureID extension with its M bit high. Frames above the
//! MTU are split into plain chunks; the S bit marks the first chunk of a
//! frame and the RTP marker its last.

use crate::common::errors::Result;
use crate::rtp::stream::RtpStream;

/// X bit: extension byte follows.
const DESC_X_BIT: u8 = 0x80;
/// S bit: first packet of a VP8 partition/frame.
const DESC_S_BIT: u8 = 0x10;
/// I bit in the extension byte: PictureID present.
const DESC_I_BIT: u8 = 0x80;

/// Descriptor (2) + 16-bit PictureID (2).
const DESCRIPTOR_LEN: usize = 4;

pub struct Vp8Packetizer {
    stream: RtpStream,
    picture_id: u16,
}

impl Vp8Packetizer {
    pub fn new(stream: RtpStream) -> Self {
        Self {
            stream,
            picture_id: 0,
        }
    }

    pub fn stream(&self) -> &RtpStream {
        &self.stream
    }

    pub fn picture_id(&self) -> u16 {
        self.picture_id
    }

    /// Sends one encoded frame; PictureID advances once per frame.
    pub async fn send_frame(&mut self, frame: &[u8], frametime_ms: f64) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        let chunk_size = self.stream.max_payload() - DESCRIPTOR_LEN;
        let count = frame.len().div_ceil(chunk_size);
        for (i, chunk) in frame.chunks(chunk_size).enumerate() {
            let mut payload = Vec::with_capacity(DESCRIPTOR_LEN + chunk.len());
            let mut b0 = DESC_X_BIT;
            if i == 0 {
                b0 |= DESC_S_BIT;
            }
            payload.push(b0);
            payload.push(DESC_I_BIT);
            payload.extend_from_slice(&(0x8000 | self.picture_id).to_be_bytes());
            payload.extend_from_slice(chunk);

            self.stream.send_packet(&payload, i + 1 == count).await?;
        }

        self.picture_id = self.picture_id.wrapping_add(1);
        self.stream.advance_timestamp(frametime_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::stream::RtpStreamSpec;
    use crate::rtp::test_util::{loopback_transport, recv_packet, zero_cipher};

    fn vp8_spec() -> RtpStreamSpec {
        RtpStreamSpec {
            extension: true,
            sr_enabled: false,
            ..RtpStreamSpec::new(0x5555_5555, 105, 90_000)
        }
    }

    #[tokio::test]
    async fn descriptor_and_picture_id() {
        let (udp, server) = loopback_transport().await;
        let cipher = zero_cipher();
        let mut packetizer = Vp8Packetizer::new(RtpStream::new(vp8_spec(), cipher.clone(), udp));

        packetizer.send_frame(&[0x9D; 100], 40.0).await.unwrap();
        let packet = recv_packet(&server).await;

        // one-byte extension header precedes the payload: 12 + 8
        let counter = u32::from_be_bytes(packet[packet.len() - 4..].try_into().unwrap());
        let payload = cipher
            .decrypt(&packet[20..packet.len() - 4], &packet[..20], counter)
            .unwrap();

        // single-packet frame: X|S then I, PictureID 0 with M bit
        assert_eq!(payload[0], 0x90);
        assert_eq!(payload[1], 0x80);
        assert_eq!(payload[2], 0x80);
        assert_eq!(payload[3], 0x00);
        assert_eq!(&payload[4..], &[0x9D; 100]);
        assert_eq!(packetizer.picture_id(), 1);
    }

    #[tokio::test]
    async fn fragments_share_picture_id() {
        let (udp, server) = loopback_transport().await;
        let cipher = zero_cipher();
        let mut packetizer = Vp8Packetizer::new(RtpStream::new(vp8_spec(), cipher.clone(), udp));

        // 3 chunks at mtu-4 budget
        packetizer.send_frame(&vec![0x01; 3000], 40.0).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let packet = recv_packet(&server).await;
            let marker = packet[1] & 0x80 != 0;
            let counter = u32::from_be_bytes(packet[packet.len() - 4..].try_into().unwrap());
            let payload = cipher
                .decrypt(&packet[20..packet.len() - 4], &packet[..20], counter)
                .unwrap();
            seen.push((payload[0], payload[1], payload[2], payload[3], marker));
        }

        // S only on the first, marker only on the last, PictureID constant
        assert_eq!(seen[0].0, 0x90);
        assert_eq!(seen[1].0, 0x80);
        assert_eq!(seen[2].0, 0x80);
        assert!(seen.iter().all(|s| s.1 == 0x80));
        assert!(seen.iter().all(|s| s.2 == 0x80 && s.3 == 0x00));
        assert_eq!(
            seen.iter().map(|s| s.4).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(packetizer.picture_id(), 1);
    }

    #[tokio::test]
    async fn picture_id_wraps_mod_2_16() {
        let (udp, _server) = loopback_transport().await;
        let mut packetizer = Vp8Packetizer::new(RtpStream::new(vp8_spec(), zero_cipher(), udp));
        packetizer.picture_id = u16::MAX;

        packetizer.send_frame(&[0x01], 40.0).await.unwrap();
        assert_eq!(packetizer.picture_id(), 0);
    }

    #[tokio::test]
    async fn high_bit_set_across_ids() {
        let (udp, server) = loopback_transport().await;
        let cipher = zero_cipher();
        let mut packetizer = Vp8Packetizer::new(RtpStream::new(vp8_spec(), cipher.clone(), udp));
        packetizer.picture_id = 0x7FFF;

        packetizer.send_frame(&[0x01], 40.0).await.unwrap();
        let packet = recv_packet(&server).await;
        let counter = u32::from_be_bytes(packet[packet.len() - 4..].try_into().unwrap());
        let payload = cipher
            .decrypt(&packet[20..packet.len() - 4], &packet[..20], counter)
            .unwrap();
        assert_eq!(payload[2] & 0x80, 0x80);
        assert_eq!(
            u16::from_be_bytes([payload[2], payload[3]]) & 0x7FFF,
            0x7FFF
        );
    }
}
