//! Encoded media packets as the demuxer hands them over.

use crate::common::types::MediaKind;

/// Rational time base of a demuxed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// 1/1000 — packets already timestamped in milliseconds.
    pub const MILLIS: TimeBase = TimeBase::new(1, 1000);
}

/// Recombines a split 64-bit presentation timestamp.
///
/// Demuxers deliver the PTS as a signed high half and unsigned low half;
/// this glues them back into the container's native 64-bit tick count.
pub fn combine_hi_lo(hi: i32, lo: u32) -> i64 {
    ((hi as i64) << 32) | lo as i64
}

/// One encoded frame (video) or one encoded Opus packet (audio), in decode
/// order, consumed exactly once by its pacing stream.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub kind: MediaKind,
    pub data: Vec<u8>,
    /// High half of the presentation timestamp, in `time_base` units.
    pub pts_hi: i32,
    /// Low half of the presentation timestamp, in `time_base` units.
    pub pts_lo: u32,
    pub time_base: TimeBase,
    /// Frame duration in `time_base` units; 0 when the demuxer doesn't know.
    pub duration: u32,
    /// Set on IDR frames / keyframes.
    pub keyframe: bool,
}

impl EncodedPacket {
    /// Presentation timestamp in milliseconds.
    pub fn pts_ms(&self) -> f64 {
        combine_hi_lo(self.pts_hi, self.pts_lo) as f64 * self.time_base.num as f64
            / self.time_base.den as f64
            * 1000.0
    }

    /// Frame duration in milliseconds, or `None` when unknown.
    pub fn duration_ms(&self) -> Option<f64> {
        if self.duration == 0 {
            return None;
        }
        Some(
            self.duration as f64 * self.time_base.num as f64 / self.time_base.den as f64 * 1000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_zero_hi() {
        assert_eq!(combine_hi_lo(0, 960), 960);
    }

    #[test]
    fn combine_full_width() {
        assert_eq!(combine_hi_lo(1, 0), 1 << 32);
        assert_eq!(combine_hi_lo(1, 0xFFFF_FFFF), (1i64 << 33) - 1);
    }

    #[test]
    fn combine_negative_hi() {
        assert_eq!(combine_hi_lo(-1, 0xFFFF_FFFF), -1);
    }

    #[test]
    fn pts_in_millis() {
        let pkt = EncodedPacket {
            kind: MediaKind::Video,
            data: vec![],
            pts_hi: 0,
            pts_lo: 3600,
            time_base: TimeBase::new(1, 90_000),
            duration: 3600,
            keyframe: false,
        };
        assert!((pkt.pts_ms() - 40.0).abs() < f64::EPSILON);
        assert!((pkt.duration_ms().unwrap() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_duration() {
        let pkt = EncodedPacket {
            kind: MediaKind::Audio,
            data: vec![],
            pts_hi: 0,
            pts_lo: 0,
            time_base: TimeBase::MILLIS,
            duration: 0,
            keyframe: false,
        };
        assert!(pkt.duration_ms().is_none());
    }
}
