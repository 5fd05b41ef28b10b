//! H.264 Annex-B packetizer (packetization-mode 1).
//!
//! Each NAL unit goes out as a Single NAL Unit Packet when it fits the MTU
//! or as a run of FU-A fragments otherwise; aggregation packets are never
//! produced. IDR access units that arrive without parameter sets get the
//! container's SPS/PPS prepended.

use crate::common::errors::{Result, StreamError};
use crate::media::ParameterSets;
use crate::rtp::annexb::nal_units;
use crate::rtp::stream::RtpStream;

pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const FUA_NALU_TYPE: u8 = 28;

const FUA_HEADER_SIZE: usize = 2;
const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;
const NALU_TYPE_MASK: u8 = 0x1F;
/// F + NRI bits, copied into the FU indicator.
const NALU_FNRI_MASK: u8 = 0xE0;

pub struct H264Packetizer {
    stream: RtpStream,
    sps: Vec<Vec<u8>>,
    pps: Vec<Vec<u8>>,
}

impl H264Packetizer {
    /// `params` comes from the container's avcC record when present;
    /// streams with in-band parameter sets can pass `None`.
    pub fn new(stream: RtpStream, params: Option<&ParameterSets>) -> Result<Self> {
        let (sps, pps) = match params {
            Some(ParameterSets::H264 { sps, pps }) => (sps.clone(), pps.clone()),
            Some(ParameterSets::H265 { .. }) => {
                return Err(StreamError::Codec(
                    "H265 parameter sets supplied to H264 packetizer".into(),
                ));
            }
            None => (Vec::new(), Vec::new()),
        };
        Ok(Self { stream, sps, pps })
    }

    pub fn stream(&self) -> &RtpStream {
        &self.stream
    }

    /// Sends one access unit; the marker bit lands on its last packet.
    pub async fn send_frame(&mut self, frame: &[u8], frametime_ms: f64) -> Result<()> {
        let nalus: Vec<&[u8]> = nal_units(frame).filter(|n| !n.is_empty()).collect();
        if nalus.is_empty() {
            return Ok(());
        }

        let access_unit = inject_parameter_sets(nalus, &self.sps, &self.pps);
        let mtu = self.stream.max_payload();
        let mut payloads = Vec::new();
        for nalu in &access_unit {
            emit_nalu(nalu, mtu, &mut payloads);
        }

        let last = payloads.len().saturating_sub(1);
        for (i, payload) in payloads.iter().enumerate() {
            self.stream.send_packet(payload, i == last).await?;
        }
        self.stream.advance_timestamp(frametime_ms);
        Ok(())
    }
}

/// Prepends missing SPS/PPS when the access unit contains an IDR.
fn inject_parameter_sets<'a>(
    nalus: Vec<&'a [u8]>,
    sps: &'a [Vec<u8>],
    pps: &'a [Vec<u8>],
) -> Vec<&'a [u8]> {
    let has_idr = nalus
        .iter()
        .any(|n| n[0] & NALU_TYPE_MASK == NALU_TYPE_IDR);
    if !has_idr {
        return nalus;
    }
    let has_sps = nalus
        .iter()
        .any(|n| n[0] & NALU_TYPE_MASK == NALU_TYPE_SPS);
    let has_pps = nalus
        .iter()
        .any(|n| n[0] & NALU_TYPE_MASK == NALU_TYPE_PPS);

    let mut unit = Vec::with_capacity(nalus.len() + sps.len() + pps.len());
    if !has_sps {
        unit.extend(sps.iter().map(|s| s.as_slice()));
    }
    if !has_pps {
        unit.extend(pps.iter().map(|p| p.as_slice()));
    }
    unit.extend(nalus);
    unit
}

/// Emits one NAL unit as a single packet or a run of FU-A fragments.
fn emit_nalu(nalu: &[u8], mtu: usize, payloads: &mut Vec<Vec<u8>>) {
    if nalu.len() <= mtu {
        payloads.push(nalu.to_vec());
        return;
    }

    let indicator = (nalu[0] & NALU_FNRI_MASK) | FUA_NALU_TYPE;
    let nalu_type = nalu[0] & NALU_TYPE_MASK;
    let body = &nalu[1..];
    let max_fragment = mtu - FUA_HEADER_SIZE;

    let count = body.len().div_ceil(max_fragment);
    for (i, chunk) in body.chunks(max_fragment).enumerate() {
        let mut fu_header = nalu_type;
        if i == 0 {
            fu_header |= FU_START_BIT;
        }
        if i + 1 == count {
            fu_header |= FU_END_BIT;
        }

        let mut out = Vec::with_capacity(FUA_HEADER_SIZE + chunk.len());
        out.push(indicator);
        out.push(fu_header);
        out.extend_from_slice(chunk);
        payloads.push(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::annexb::extend_with_start_code;
    use crate::rtp::stream::RtpStreamSpec;
    use crate::rtp::test_util::{loopback_transport, recv_packet, zero_cipher};

    fn sample_params() -> ParameterSets {
        ParameterSets::H264 {
            sps: vec![vec![0x67, 0x42, 0x00, 0x1E]],
            pps: vec![vec![0x68, 0xCE, 0x38, 0x80]],
        }
    }

    fn video_spec() -> RtpStreamSpec {
        RtpStreamSpec {
            extension: true,
            sr_enabled: false,
            ..RtpStreamSpec::new(0x3333_3333, 101, 90_000)
        }
    }

    #[test]
    fn idr_injection_order() {
        let sps = vec![vec![0x67, 0x01]];
        let pps = vec![vec![0x68, 0x02]];
        let idr: &[u8] = &[0x65, 0x88, 0x84];
        let unit = inject_parameter_sets(vec![idr], &sps, &pps);
        assert_eq!(unit, vec![&[0x67, 0x01][..], &[0x68, 0x02][..], idr]);
    }

    #[test]
    fn no_injection_when_present() {
        let stored_sps = vec![vec![0x67, 0x01]];
        let stored_pps = vec![vec![0x68, 0x02]];
        let sps: &[u8] = &[0x67, 0xAA];
        let pps: &[u8] = &[0x68, 0xBB];
        let idr: &[u8] = &[0x65, 0xCC];
        let unit = inject_parameter_sets(vec![sps, pps, idr], &stored_sps, &stored_pps);
        assert_eq!(unit, vec![sps, pps, idr]);
    }

    #[test]
    fn no_injection_on_non_idr() {
        let sps = vec![vec![0x67, 0x01]];
        let pps = vec![vec![0x68, 0x02]];
        let slice: &[u8] = &[0x41, 0x9A];
        let unit = inject_parameter_sets(vec![slice], &sps, &pps);
        assert_eq!(unit, vec![slice]);
    }

    #[test]
    fn fu_a_fragmentation() {
        let mut nalu = vec![0x65u8];
        nalu.extend_from_slice(&(0..=14).collect::<Vec<u8>>());
        let mut payloads = Vec::new();
        emit_nalu(&nalu, 7, &mut payloads);

        assert_eq!(payloads.len(), 3);
        // indicator copies NRI from 0x65 (0x60), type 28
        for p in &payloads {
            assert_eq!(p[0], 0x60 | 28);
            assert_eq!(p[1] & NALU_TYPE_MASK, NALU_TYPE_IDR);
        }
        assert_eq!(payloads[0][1] & FU_START_BIT, FU_START_BIT);
        assert_eq!(payloads[0][1] & FU_END_BIT, 0);
        assert_eq!(payloads[1][1] & (FU_START_BIT | FU_END_BIT), 0);
        assert_eq!(payloads[2][1] & FU_END_BIT, FU_END_BIT);
        assert_eq!(payloads[2][1] & FU_START_BIT, 0);

        // fragments reassemble into the original body
        let body: Vec<u8> = payloads.iter().flat_map(|p| p[2..].to_vec()).collect();
        assert_eq!(body, nalu[1..]);
    }

    #[test]
    fn single_packet_below_mtu() {
        let nalu = [0x41, 0x01, 0x02];
        let mut payloads = Vec::new();
        emit_nalu(&nalu, 1200, &mut payloads);
        assert_eq!(payloads, vec![nalu.to_vec()]);
    }

    #[tokio::test]
    async fn marker_on_last_packet_only() {
        let (udp, server) = loopback_transport().await;
        let stream = RtpStream::new(video_spec(), zero_cipher(), udp);
        let mut packetizer = H264Packetizer::new(stream, Some(&sample_params())).unwrap();

        // an IDR large enough for several FU-A fragments
        let mut frame = Vec::new();
        let mut idr = vec![0x65];
        idr.extend(std::iter::repeat_n(0x11u8, 3000));
        extend_with_start_code(&mut frame, &idr);

        packetizer.send_frame(&frame, 40.0).await.unwrap();

        // SPS + PPS singles, then 3 FU-A fragments (3000 / 1198)
        let mut markers = Vec::new();
        for _ in 0..5 {
            let packet = recv_packet(&server).await;
            markers.push(packet[1] & 0x80 != 0);
        }
        assert_eq!(markers, vec![false, false, false, false, true]);
        assert_eq!(packetizer.stream().timestamp(), 3600);
    }

    #[tokio::test]
    async fn rejects_hevc_parameter_sets() {
        let (udp, _server) = loopback_transport().await;
        let stream = RtpStream::new(video_spec(), zero_cipher(), udp);
        let params = ParameterSets::H265 {
            vps: vec![],
            sps: vec![],
            pps: vec![],
        };
        assert!(matches!(
            H264Packetizer::new(stream, Some(&params)),
            Err(StreamError::Codec(_))
        ));
    }
}
