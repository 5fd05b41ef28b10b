//! H.265/HEVC Annex-B packetizer.
//!
//! Same shape as the H.264 path with the two-byte NAL header: Single NAL
//! Unit Packets below the MTU, FU (type 49) runs above it, and VPS/SPS/PPS
//! injection ahead of IDR access units.

use crate::common::errors::{Result, StreamError};
use crate::media::ParameterSets;
use crate::rtp::annexb::nal_units;
use crate::rtp::stream::RtpStream;

pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const FU_NALU_TYPE: u8 = 49;

/// Two-byte payload header plus the FU header.
const FU_TOTAL_HEADER_SIZE: usize = 3;
const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;

/// NAL unit type from the first header byte.
fn nalu_type(nalu: &[u8]) -> u8 {
    (nalu[0] >> 1) & 0x3F
}

fn is_idr(nalu: &[u8]) -> bool {
    matches!(nalu_type(nalu), NALU_TYPE_IDR_W_RADL | NALU_TYPE_IDR_N_LP)
}

pub struct H265Packetizer {
    stream: RtpStream,
    vps: Vec<Vec<u8>>,
    sps: Vec<Vec<u8>>,
    pps: Vec<Vec<u8>>,
}

impl H265Packetizer {
    /// `params` comes from the container's hvcC record when present.
    pub fn new(stream: RtpStream, params: Option<&ParameterSets>) -> Result<Self> {
        let (vps, sps, pps) = match params {
            Some(ParameterSets::H265 { vps, sps, pps }) => {
                (vps.clone(), sps.clone(), pps.clone())
            }
            Some(ParameterSets::H264 { .. }) => {
                return Err(StreamError::Codec(
                    "H264 parameter sets supplied to H265 packetizer".into(),
                ));
            }
            None => (Vec::new(), Vec::new(), Vec::new()),
        };
        Ok(Self {
            stream,
            vps,
            sps,
            pps,
        })
    }

    pub fn stream(&self) -> &RtpStream {
        &self.stream
    }

    /// Sends one access unit; the marker bit lands on its last packet.
    pub async fn send_frame(&mut self, frame: &[u8], frametime_ms: f64) -> Result<()> {
        let nalus: Vec<&[u8]> = nal_units(frame).filter(|n| n.len() >= 2).collect();
        if nalus.is_empty() {
            return Ok(());
        }

        let access_unit = inject_parameter_sets(nalus, &self.vps, &self.sps, &self.pps);
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

/// Prepends missing VPS/SPS/PPS when the access unit contains an IDR.
fn inject_parameter_sets<'a>(
    nalus: Vec<&'a [u8]>,
    vps: &'a [Vec<u8>],
    sps: &'a [Vec<u8>],
    pps: &'a [Vec<u8>],
) -> Vec<&'a [u8]> {
    if !nalus.iter().any(|n| is_idr(n)) {
        return nalus;
    }
    let has_vps = nalus.iter().any(|n| nalu_type(n) == NALU_TYPE_VPS);
    let has_sps = nalus.iter().any(|n| nalu_type(n) == NALU_TYPE_SPS);
    let has_pps = nalus.iter().any(|n| nalu_type(n) == NALU_TYPE_PPS);

    let mut unit = Vec::with_capacity(nalus.len() + vps.len() + sps.len() + pps.len());
    if !has_vps {
        unit.extend(vps.iter().map(|v| v.as_slice()));
    }
    if !has_sps {
        unit.extend(sps.iter().map(|s| s.as_slice()));
    }
    if !has_pps {
        unit.extend(pps.iter().map(|p| p.as_slice()));
    }
    unit.extend(nalus);
    unit
}

/// Emits one NAL unit as a single packet or a run of FU fragments.
fn emit_nalu(nalu: &[u8], mtu: usize, payloads: &mut Vec<Vec<u8>>) {
    if nalu.len() <= mtu {
        payloads.push(nalu.to_vec());
        return;
    }

    // FU payload header: F + LayerId + TID copied, type replaced with 49
    let header0 = (nalu[0] & 0x81) | (FU_NALU_TYPE << 1);
    let header1 = nalu[1];
    let typ = nalu_type(nalu);
    let body = &nalu[2..];
    let max_fragment = mtu - FU_TOTAL_HEADER_SIZE;

    let count = body.len().div_ceil(max_fragment);
    for (i, chunk) in body.chunks(max_fragment).enumerate() {
        let mut fu_header = typ;
        if i == 0 {
            fu_header |= FU_START_BIT;
        }
        if i + 1 == count {
            fu_header |= FU_END_BIT;
        }

        let mut out = Vec::with_capacity(FU_TOTAL_HEADER_SIZE + chunk.len());
        out.push(header0);
        out.push(header1);
        out.push(fu_header);
        out.extend_from_slice(chunk);
        payloads.push(out);
    }
}
