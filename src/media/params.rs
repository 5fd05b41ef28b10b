//! Out-of-band codec parameter sets.
//!
//! H.26x containers carry SPS/PPS (and VPS for HEVC) in an avcC/hvcC
//! configuration record instead of the bitstream. The record is parsed once
//! when the session starts and the raw NAL units are re-injected into the
//! Annex-B stream ahead of every IDR frame that lacks them.

use crate::common::errors::{Result, StreamError};

/// Parameter sets extracted from container extradata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterSets {
    H264 {
        sps: Vec<Vec<u8>>,
        pps: Vec<Vec<u8>>,
    },
    H265 {
        vps: Vec<Vec<u8>>,
        sps: Vec<Vec<u8>>,
        pps: Vec<Vec<u8>>,
    },
}

const HEVC_NALU_VPS: u8 = 32;
const HEVC_NALU_SPS: u8 = 33;
const HEVC_NALU_PPS: u8 = 34;

fn codec_err(msg: impl Into<String>) -> StreamError {
    StreamError::Codec(msg.into())
}

/// Reads a 16-bit length-prefixed blob, advancing `offset`.
fn read_prefixed<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    if *offset + 2 > data.len() {
        return Err(codec_err("truncated length prefix in configuration record"));
    }
    let len = u16::from_be_bytes([data[*offset], data[*offset + 1]]) as usize;
    *offset += 2;
    if *offset + len > data.len() {
        return Err(codec_err("truncated NAL unit in configuration record"));
    }
    let blob = &data[*offset..*offset + len];
    *offset += len;
    Ok(blob)
}

impl ParameterSets {
    /// Parses an ISO-BMFF `avcC` record (AVCDecoderConfigurationRecord).
    pub fn from_avcc(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(codec_err("avcC record too short"));
        }
        if data[0] != 1 {
            return Err(codec_err(format!(
                "avcC configurationVersion {} is not 1",
                data[0]
            )));
        }

        let sps_count = (data[5] & 0x1F) as usize;
        let mut offset = 6;
        let mut sps = Vec::with_capacity(sps_count);
        for _ in 0..sps_count {
            sps.push(read_prefixed(data, &mut offset)?.to_vec());
        }

        if offset >= data.len() {
            return Err(codec_err("avcC record missing PPS count"));
        }
        let pps_count = data[offset] as usize;
        offset += 1;
        let mut pps = Vec::with_capacity(pps_count);
        for _ in 0..pps_count {
            pps.push(read_prefixed(data, &mut offset)?.to_vec());
        }

        Ok(ParameterSets::H264 { sps, pps })
    }

    /// Parses an ISO-BMFF `hvcC` record (HEVCDecoderConfigurationRecord).
    pub fn from_hvcc(data: &[u8]) -> Result<Self> {
        if data.len() < 23 {
            return Err(codec_err("hvcC record too short"));
        }
        if data[0] != 1 {
            return Err(codec_err(format!(
                "hvcC configurationVersion {} is not 1",
                data[0]
            )));
        }

        let num_arrays = data[22] as usize;
        let mut offset = 23;
        let mut vps = Vec::new();
        let mut sps = Vec::new();
        let mut pps = Vec::new();

        for _ in 0..num_arrays {
            if offset + 3 > data.len() {
                return Err(codec_err("truncated hvcC NAL array header"));
            }
            let nal_type = data[offset] & 0x3F;
            let num_nalus = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;

            for _ in 0..num_nalus {
                let nalu = read_prefixed(data, &mut offset)?.to_vec();
                match nal_type {
                    HEVC_NALU_VPS => vps.push(nalu),
                    HEVC_NALU_SPS => sps.push(nalu),
                    HEVC_NALU_PPS => pps.push(nalu),
                    _ => {}
                }
            }
        }

        Ok(ParameterSets::H265 { vps, sps, pps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal avcC: version 1, one SPS `[67 42 00 1E]`, one PPS `[68 CE]`.
    fn sample_avcc() -> Vec<u8> {
        vec![
            0x01, 0x42, 0x00, 0x1E, 0xFF, // header
            0xE1, // 1 SPS
            0x00, 0x04, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x01, // 1 PPS
            0x00, 0x02, 0x68, 0xCE, // PPS
        ]
    }

    #[test]
    fn parse_avcc() {
        let ps = ParameterSets::from_avcc(&sample_avcc()).unwrap();
        let ParameterSets::H264 { sps, pps } = ps else {
            panic!("expected H264 parameter sets");
        };
        assert_eq!(sps, vec![vec![0x67, 0x42, 0x00, 0x1E]]);
        assert_eq!(pps, vec![vec![0x68, 0xCE]]);
    }

    #[test]
    fn avcc_rejects_bad_version() {
        let mut data = sample_avcc();
        data[0] = 0;
        let err = ParameterSets::from_avcc(&data).unwrap_err();
        assert!(matches!(err, StreamError::Codec(_)));
    }

    #[test]
    fn avcc_rejects_truncated() {
        let data = &sample_avcc()[..9];
        assert!(ParameterSets::from_avcc(data).is_err());
    }

    /// Minimal hvcC with one VPS, one SPS and one PPS array.
    fn sample_hvcc() -> Vec<u8> {
        let mut data = vec![0u8; 22];
        data[0] = 1;
        data.push(3); // numOfArrays
        for (nal_type, payload) in [
            (HEVC_NALU_VPS, vec![0x40, 0x01, 0x0C]),
            (HEVC_NALU_SPS, vec![0x42, 0x01, 0x01]),
            (HEVC_NALU_PPS, vec![0x44, 0x01]),
        ] {
            data.push(nal_type);
            data.extend_from_slice(&1u16.to_be_bytes());
            data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            data.extend_from_slice(&payload);
        }
        data
    }

    #[test]
    fn parse_hvcc() {
        let ps = ParameterSets::from_hvcc(&sample_hvcc()).unwrap();
        let ParameterSets::H265 { vps, sps, pps } = ps else {
            panic!("expected H265 parameter sets");
        };
        assert_eq!(vps, vec![vec![0x40, 0x01, 0x0C]]);
        assert_eq!(sps, vec![vec![0x42, 0x01, 0x01]]);
        assert_eq!(pps, vec![vec![0x44, 0x01]]);
    }

    #[test]
    fn hvcc_rejects_bad_version() {
        let mut data = sample_hvcc();
        data[0] = 2;
        assert!(ParameterSets::from_hvcc(&data).is_err());
    }
}
