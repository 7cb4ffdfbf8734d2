//! Timestamped frame formats: Mark4, VLBA, Mark5B and VDIF.
//!
//! A [`FrameDescriptor`] captures everything a transfer needs to know about
//! a sample stream's framing: syncword position, header/payload split,
//! frame duration, and how to decode and encode the embedded time code.
//! Mark4 and VLBA interleave one header per track bit-by-bit; their time
//! codes are read from track 0 and written to all tracks.

pub mod crc;
pub mod timecode;

use crate::hrtime::HighResTime;
use byteorder::{ByteOrder, LittleEndian};
use num_rational::Ratio;
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use timecode::{Fps, MARK5B_SYNCWORD};

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown frame format `{0}'")]
    UnknownFormat(String),
    #[error("track count {0} not supported for {1}")]
    BadTrackCount(u32, FrameFormat),
    #[error("frame shorter than header: {0} bytes")]
    ShortFrame(usize),
    #[error("bad time code: {0}")]
    BadTimeCode(String),
    #[error("bad frame rate: {0}")]
    BadFrameRate(String),
    #[error("cannot split frame: {0}")]
    BadSplit(String),
    #[error("format has no time code")]
    NoTimeCode,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    Mark4,
    Vlba,
    Mark5B,
    Vdif,
    VdifLegacy,
}

impl FrameFormat {
    pub fn is_vdif(self) -> bool {
        matches!(self, FrameFormat::Vdif | FrameFormat::VdifLegacy)
    }

    /// Tape-era formats replicate their header bit-interleaved on every
    /// track.
    pub fn is_tracked(self) -> bool {
        matches!(self, FrameFormat::Mark4 | FrameFormat::Vlba)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameFormat::Mark4 => "mark4",
            FrameFormat::Vlba => "vlba",
            FrameFormat::Mark5B => "mark5b",
            FrameFormat::Vdif => "vdif",
            FrameFormat::VdifLegacy => "vdif_legacy",
        };
        f.write_str(s)
    }
}

impl FromStr for FrameFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mark4" | "mk4" => Ok(FrameFormat::Mark4),
            "vlba" => Ok(FrameFormat::Vlba),
            "mark5b" | "mk5b" => Ok(FrameFormat::Mark5B),
            "vdif" => Ok(FrameFormat::Vdif),
            "vdif_legacy" | "vdifl" => Ok(FrameFormat::VdifLegacy),
            other => Err(Error::UnknownFormat(other.to_owned())),
        }
    }
}

/// Everything size- and time-related about one frame format instance.
#[derive(Clone, Debug)]
pub struct FrameDescriptor {
    pub format: FrameFormat,
    pub ntrack: u32,
    /// Bit rate per track in bits per second; exact to allow rates that do
    /// not divide the frame length evenly.
    pub trackbitrate: Ratio<u64>,
    pub syncword_offset: u32,
    pub syncword: SmallVec<[u8; 8]>,
    pub headersize: u32,
    pub framesize: u32,
    pub payloadsize: u32,
    pub payloadoffset: u32,
    /// Complex (I/Q) sampling; VDIF only.
    pub complex: bool,
}

impl FrameDescriptor {
    /// Builds a descriptor for `format` with `ntrack` tracks. For VDIF the
    /// frame layout is not derivable from the track count, so the payload
    /// size must be given; other formats ignore it.
    pub fn new(
        format: FrameFormat,
        ntrack: u32,
        trackbitrate: Ratio<u64>,
        vdif_payload: u32,
    ) -> Result<Self> {
        let tracked_ok = matches!(ntrack, 8 | 16 | 32 | 64);
        match format {
            FrameFormat::Mark4 => {
                if !tracked_ok {
                    return Err(Error::BadTrackCount(ntrack, format));
                }
                Ok(FrameDescriptor {
                    format,
                    ntrack,
                    trackbitrate,
                    // per track: 8 bytes aux, 4 bytes of ones, 8 bytes time code
                    syncword_offset: 8 * ntrack,
                    syncword: SmallVec::from_elem(0xff, (4 * ntrack) as usize),
                    headersize: 20 * ntrack,
                    framesize: 2500 * ntrack,
                    payloadsize: 2480 * ntrack,
                    payloadoffset: 20 * ntrack,
                    complex: false,
                })
            }
            FrameFormat::Vlba => {
                if !tracked_ok {
                    return Err(Error::BadTrackCount(ntrack, format));
                }
                Ok(FrameDescriptor {
                    format,
                    ntrack,
                    trackbitrate,
                    syncword_offset: 0,
                    syncword: SmallVec::from_elem(0xff, (4 * ntrack) as usize),
                    headersize: 12 * ntrack,
                    framesize: 2520 * ntrack,
                    payloadsize: 2508 * ntrack,
                    payloadoffset: 12 * ntrack,
                    complex: false,
                })
            }
            FrameFormat::Mark5B => {
                if ntrack != 32 {
                    return Err(Error::BadTrackCount(ntrack, format));
                }
                let mut sync = SmallVec::new();
                sync.extend_from_slice(&MARK5B_SYNCWORD.to_le_bytes());
                Ok(FrameDescriptor {
                    format,
                    ntrack,
                    trackbitrate,
                    syncword_offset: 0,
                    syncword: sync,
                    headersize: 16,
                    framesize: 10_016,
                    payloadsize: 10_000,
                    payloadoffset: 16,
                    complex: false,
                })
            }
            FrameFormat::Vdif | FrameFormat::VdifLegacy => {
                if ntrack == 0 || vdif_payload == 0 || vdif_payload % 8 != 0 {
                    return Err(Error::BadSplit(format!(
                        "vdif needs a payload size that is a multiple of 8, got {}",
                        vdif_payload
                    )));
                }
                let headersize = if format == FrameFormat::VdifLegacy { 16 } else { 32 };
                Ok(FrameDescriptor {
                    format,
                    ntrack,
                    trackbitrate,
                    syncword_offset: 0,
                    syncword: SmallVec::new(),
                    headersize,
                    framesize: headersize + vdif_payload,
                    payloadsize: vdif_payload,
                    payloadoffset: headersize,
                    complex: false,
                })
            }
        }
    }

    pub fn complex(mut self) -> Self {
        self.complex = true;
        self
    }

    /// Frames per second, exact. Data-replacement formats clock header bits
    /// as data; Mark5B and VDIF count payload bits only.
    pub fn fps(&self) -> Result<Fps> {
        let bits_per_frame = match self.format {
            FrameFormat::Mark4 | FrameFormat::Vlba => u64::from(self.framesize) * 8,
            _ => u64::from(self.payloadsize) * 8,
        };
        let total_rate = self.trackbitrate * Ratio::from_integer(u64::from(self.ntrack));
        Fps::new(total_rate / Ratio::from_integer(bits_per_frame))
    }

    /// True if the window starts with a frame (syncword in place). Formats
    /// without a syncword accept any window long enough.
    pub fn is_frame(&self, window: &[u8]) -> bool {
        if window.len() < self.framesize as usize {
            return false;
        }
        let at = self.syncword_offset as usize;
        window[at..at + self.syncword.len()] == self.syncword[..]
    }

    /// Byte offset of the first frame in `window`, found by syncword
    /// search. `None` for syncword-less formats or when no match exists.
    pub fn locate(&self, window: &[u8]) -> Option<usize> {
        if self.syncword.is_empty() {
            return None;
        }
        let sync = &self.syncword[..];
        let offset = self.syncword_offset as usize;
        window
            .windows(sync.len())
            .position(|w| w == sync)
            .and_then(|pos| pos.checked_sub(offset))
    }

    /// Full header check: syncword, and the format's CRC when `check_crc`
    /// is set. VDIF has neither and always passes.
    pub fn check(&self, frame: &[u8], check_crc: bool) -> bool {
        if self.format.is_vdif() {
            return frame.len() >= self.headersize as usize;
        }
        if !self.is_frame(frame) {
            return false;
        }
        if !check_crc {
            return true;
        }
        match self.format {
            FrameFormat::Mark5B => timecode::check_mark5b_crc(frame),
            FrameFormat::Mark4 => {
                timecode::check_mark4_crc(&self.extract_track0(frame, 20))
            }
            FrameFormat::Vlba => {
                timecode::check_vlba_crc(&self.extract_track0(frame, 12))
            }
            _ => true,
        }
    }

    /// De-interleaves track 0's first `nbytes` header bytes.
    fn extract_track0(&self, frame: &[u8], nbytes: usize) -> Vec<u8> {
        let n = self.ntrack as usize;
        let mut out = vec![0u8; nbytes];
        for k in 0..nbytes * 8 {
            let bit = k * n; // track 0's k-th bit position in the stream
            let byte = bit / 8;
            if byte >= frame.len() {
                break;
            }
            let v = (frame[byte] >> (7 - bit % 8)) & 1;
            out[k / 8] |= v << (7 - k % 8);
        }
        out
    }

    /// Interleaves the per-track header onto every track of the frame.
    fn spread_tracks(&self, frame: &mut [u8], track: &[u8]) {
        let n = self.ntrack as usize;
        for k in 0..track.len() * 8 {
            let v = (track[k / 8] >> (7 - k % 8)) & 1;
            for t in 0..n {
                let bit = k * n + t;
                let byte = bit / 8;
                if byte >= frame.len() {
                    return;
                }
                let mask = 1 << (7 - bit % 8);
                if v == 1 {
                    frame[byte] |= mask;
                } else {
                    frame[byte] &= !mask;
                }
            }
        }
    }

    /// Decodes the frame's time stamp. Truncated date fields resolve near
    /// `reference`.
    pub fn decode_time(&self, frame: &[u8], reference: HighResTime) -> Result<HighResTime> {
        if frame.len() < self.headersize as usize {
            return Err(Error::ShortFrame(frame.len()));
        }
        if self.headersize == 0 {
            return Err(Error::NoTimeCode);
        }
        match self.format {
            FrameFormat::Mark5B => timecode::decode_mark5b(frame, &self.fps()?, reference),
            FrameFormat::Mark4 => timecode::decode_mark4(&self.extract_track0(frame, 20), reference),
            FrameFormat::Vlba => timecode::decode_vlba(&self.extract_track0(frame, 12), reference),
            FrameFormat::Vdif | FrameFormat::VdifLegacy => {
                timecode::decode_vdif(frame, &self.fps()?)
            }
        }
    }

    /// Writes `t` into the frame's time code (all tracks for the tape
    /// formats).
    pub fn encode_time(&self, frame: &mut [u8], t: HighResTime) -> Result<()> {
        if frame.len() < self.headersize as usize {
            return Err(Error::ShortFrame(frame.len()));
        }
        if self.headersize == 0 {
            return Err(Error::NoTimeCode);
        }
        match self.format {
            FrameFormat::Mark5B => timecode::encode_mark5b(frame, t, &self.fps()?),
            FrameFormat::Mark4 => {
                let mut track = self.extract_track0(frame, 20);
                timecode::encode_mark4(&mut track, t)?;
                self.spread_tracks(frame, &track);
                Ok(())
            }
            FrameFormat::Vlba => {
                let mut track = self.extract_track0(frame, 12);
                timecode::encode_vlba(&mut track, t)?;
                self.spread_tracks(frame, &track);
                Ok(())
            }
            FrameFormat::Vdif | FrameFormat::VdifLegacy => {
                timecode::encode_vdif(frame, t, &self.fps()?)
            }
        }
    }

    /// Splits the frame into `k` headerless chunks of `ntrack / k` tracks.
    pub fn divide(&self, k: u32) -> Result<FrameDescriptor> {
        if k == 0 || self.ntrack % k != 0 || self.payloadsize % k != 0 {
            return Err(Error::BadSplit(format!("{} tracks / {}", self.ntrack, k)));
        }
        Ok(self.headerless(self.ntrack / k, self.payloadsize / k))
    }

    /// Extracts `take` tracks out of every `outof` chunks (headerless).
    pub fn divide_complex(&self, outof: u32, take: u32) -> Result<FrameDescriptor> {
        if outof == 0
            || take == 0
            || take > outof
            || (self.ntrack * take) % outof != 0
            || (self.payloadsize * take) % outof != 0
        {
            return Err(Error::BadSplit(format!(
                "{} tracks, take {} of {}",
                self.ntrack, take, outof
            )));
        }
        Ok(self.headerless(self.ntrack * take / outof, self.payloadsize * take / outof))
    }

    /// Accumulates `k` frames into one logical payload; format identity is
    /// preserved.
    pub fn multiply(&self, k: u32) -> Result<FrameDescriptor> {
        if k == 0 {
            return Err(Error::BadSplit("multiply by zero".into()));
        }
        let mut out = self.clone();
        out.payloadsize = self.payloadsize * k;
        out.framesize = out.headersize + out.payloadsize;
        Ok(out)
    }

    fn headerless(&self, ntrack: u32, payloadsize: u32) -> FrameDescriptor {
        FrameDescriptor {
            format: self.format,
            ntrack,
            trackbitrate: self.trackbitrate,
            syncword_offset: 0,
            syncword: SmallVec::new(),
            headersize: 0,
            framesize: payloadsize,
            payloadsize,
            payloadoffset: 0,
            complex: self.complex,
        }
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}tr@{}bps/{}B",
            self.format, self.ntrack, self.trackbitrate, self.framesize
        )
    }
}

/// Convenience for Mark5B: a complete header for `t`.
pub fn mark5b_header(t: HighResTime, fps: &Fps) -> Result<[u8; 16]> {
    let mut hdr = [0u8; 16];
    timecode::encode_mark5b(&mut hdr, t, fps)?;
    LittleEndian::write_u32(&mut hdr[0..4], MARK5B_SYNCWORD);
    Ok(hdr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> HighResTime {
        HighResTime::from_secs(1_614_859_200) // 2021-03-04
    }

    #[test]
    fn descriptor_invariants_hold() {
        let rate = Ratio::from_integer(8_000_000u64);
        for d in &[
            FrameDescriptor::new(FrameFormat::Mark4, 32, rate, 0).unwrap(),
            FrameDescriptor::new(FrameFormat::Vlba, 16, rate, 0).unwrap(),
            FrameDescriptor::new(FrameFormat::Mark5B, 32, rate, 0).unwrap(),
            FrameDescriptor::new(FrameFormat::Vdif, 4, rate, 8000).unwrap(),
            FrameDescriptor::new(FrameFormat::VdifLegacy, 1, rate, 1024).unwrap(),
        ] {
            assert_eq!(d.headersize + d.payloadsize, d.framesize, "{}", d);
            assert!(d.payloadoffset >= d.headersize, "{}", d);
        }
    }

    #[test]
    fn mark5b_frame_detection() {
        let rate = Ratio::from_integer(32_000_000u64);
        let d = FrameDescriptor::new(FrameFormat::Mark5B, 32, rate, 0).unwrap();
        let mut frame = vec![0u8; d.framesize as usize];
        d.encode_time(&mut frame, reference()).unwrap();
        assert!(d.is_frame(&frame));
        assert!(d.check(&frame, true));
        frame[0] ^= 0xff;
        assert!(!d.is_frame(&frame));
    }

    #[test]
    fn locate_finds_offset_syncword() {
        let rate = Ratio::from_integer(32_000_000u64);
        let d = FrameDescriptor::new(FrameFormat::Mark5B, 32, rate, 0).unwrap();
        let mut window = vec![0u8; 64];
        window[24..28].copy_from_slice(&MARK5B_SYNCWORD.to_le_bytes());
        assert_eq!(d.locate(&window), Some(24));
    }

    #[test]
    fn mark5b_time_roundtrip() {
        let rate = Ratio::from_integer(32_000_000u64); // 12800 fps
        let d = FrameDescriptor::new(FrameFormat::Mark5B, 32, rate, 0).unwrap();
        let fps = d.fps().unwrap();
        let mut frame = vec![0u8; d.framesize as usize];
        let t = fps.time_of(reference().secs() + 100, 1234);
        d.encode_time(&mut frame, t).unwrap();
        assert_eq!(d.decode_time(&frame, reference()).unwrap(), t);
    }

    #[test]
    fn tracked_formats_roundtrip_through_interleave() {
        let rate = Ratio::from_integer(8_000_000u64);
        for fmt in &[FrameFormat::Mark4, FrameFormat::Vlba] {
            let d = FrameDescriptor::new(*fmt, 16, rate, 0).unwrap();
            let mut frame = vec![0u8; d.framesize as usize];
            let t = HighResTime::new(reference().secs() + 3600, Ratio::new(5, 400));
            d.encode_time(&mut frame, t).unwrap();
            assert!(d.is_frame(&frame), "{} syncword", fmt);
            assert!(d.check(&frame, true), "{} crc", fmt);
            assert_eq!(d.decode_time(&frame, reference()).unwrap(), t, "{}", fmt);
        }
    }

    #[test]
    fn vdif_fps_and_roundtrip() {
        let rate = Ratio::from_integer(64_000_000u64);
        let d = FrameDescriptor::new(FrameFormat::Vdif, 8, rate, 8000).unwrap();
        let fps = d.fps().unwrap();
        assert_eq!(fps.rate(), Ratio::from_integer(8000)); // 512 Mb/s over 64 kb frames
        let mut frame = vec![0u8; d.framesize as usize];
        let t = fps.time_of(reference().secs() + 7, 4321);
        d.encode_time(&mut frame, t).unwrap();
        assert_eq!(d.decode_time(&frame, reference()).unwrap(), t);
    }

    #[test]
    fn divide_zeroes_header_fields() {
        let rate = Ratio::from_integer(16_000_000u64);
        let d = FrameDescriptor::new(FrameFormat::Mark5B, 32, rate, 0).unwrap();
        let half = d.divide(2).unwrap();
        assert_eq!(half.ntrack, 16);
        assert_eq!(half.headersize, 0);
        assert_eq!(half.payloadoffset, 0);
        assert_eq!(half.framesize, half.payloadsize);
        assert_eq!(half.framesize, 5000);
        assert!(half.syncword.is_empty());
    }

    #[test]
    fn divide_complex_takes_subset() {
        let rate = Ratio::from_integer(16_000_000u64);
        let d = FrameDescriptor::new(FrameFormat::Vdif, 8, rate, 8000).unwrap();
        let sub = d.divide_complex(4, 3).unwrap();
        assert_eq!(sub.ntrack, 6);
        assert_eq!(sub.payloadsize, 6000);
        assert_eq!(sub.headersize, 0);
    }

    #[test]
    fn multiply_keeps_format_identity() {
        let rate = Ratio::from_integer(32_000_000u64);
        let d = FrameDescriptor::new(FrameFormat::Mark5B, 32, rate, 0).unwrap();
        let acc = d.multiply(4).unwrap();
        assert_eq!(acc.format, FrameFormat::Mark5B);
        assert_eq!(acc.payloadsize, 40_000);
        assert_eq!(acc.framesize, 40_016);
        assert_eq!(acc.headersize, 16);
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("mark5b".parse::<FrameFormat>().unwrap(), FrameFormat::Mark5B);
        assert_eq!("VDIF".parse::<FrameFormat>().unwrap(), FrameFormat::Vdif);
        assert!("mark6".parse::<FrameFormat>().is_err());
    }
}
