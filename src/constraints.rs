//! Data-rate / packet-size constraint solver.
//!
//! Given the network parameters (protocol family, MTU, nominal block size),
//! an optional fixed frame size and an optional compression solution, derive
//! a consistent set of block, read and write sizes. Transfers read
//! `read_size` bytes at a time from their source, optionally compress, and
//! emit `write_size` bytes; `blocksize` is the granularity of buffering and
//! must hold an integral number of reads.

use crate::frame::{FrameDescriptor, FrameFormat};
use crate::net::NetParms;
use crate::trackmask::Solution;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("constraint error: {0}")]
    Invalid(String),
    #[error("no feasible sizes for {0}")]
    Unsatisfiable(String),
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Constraint {
    FrameSize,
    BlockSize,
    Mtu,
    CompressOffset,
    ApplicationOverhead,
    ProtocolOverhead,
    ReadSize,
    WriteSize,
    NMtu,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Constraint::FrameSize => "framesize",
            Constraint::BlockSize => "blocksize",
            Constraint::Mtu => "MTU",
            Constraint::CompressOffset => "compress_offset",
            Constraint::ApplicationOverhead => "application_overhead",
            Constraint::ProtocolOverhead => "protocol_overhead",
            Constraint::ReadSize => "read_size",
            Constraint::WriteSize => "write_size",
            Constraint::NMtu => "n_mtu",
        };
        f.write_str(name)
    }
}

/// Named size constraints; an absent entry means "unconstrained".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConstraintSet {
    values: BTreeMap<Constraint, u32>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        ConstraintSet::default()
    }

    pub fn get(&self, c: Constraint) -> Option<u32> {
        self.values.get(&c).copied()
    }

    pub fn set(&mut self, c: Constraint, value: u32) {
        self.values.insert(c, value);
    }

    fn require(&self, c: Constraint) -> Result<u32> {
        self.get(c)
            .ok_or_else(|| Error::Invalid(format!("{} is unconstrained in {}", c, self)))
    }

    /// Checks every output invariant; a solved set must pass.
    pub fn validate(&self) -> Result<()> {
        let must = |cond: bool, what: &str| -> Result<()> {
            if cond {
                Ok(())
            } else {
                Err(Error::Invalid(format!("{} violated by {}", what, self)))
            }
        };
        let blocksize = self.require(Constraint::BlockSize)?;
        let read = self.require(Constraint::ReadSize)?;
        let write = self.require(Constraint::WriteSize)?;
        let mtu = self.require(Constraint::Mtu)?;
        let proto = self.require(Constraint::ProtocolOverhead)?;
        let app = self.require(Constraint::ApplicationOverhead)?;
        let offset = self.require(Constraint::CompressOffset)?;

        must(blocksize > 0, "blocksize > 0")?;
        must(read > 0, "read_size > 0")?;
        must(write > 0, "write_size > 0")?;
        must(mtu > 0, "MTU > 0")?;
        must(blocksize % 8 == 0, "blocksize % 8 == 0")?;
        must(offset % 8 == 0, "compress_offset % 8 == 0")?;
        must(blocksize >= read, "blocksize >= read_size")?;
        must(blocksize % read == 0, "blocksize % read_size == 0")?;
        must(offset < read, "compress_offset < read_size")?;
        must(write <= read, "write_size <= read_size")?;
        match self.get(Constraint::NMtu) {
            None | Some(1) => (),
            Some(_) => return Err(Error::Invalid(format!("n_mtu not 1 in {}", self))),
        }
        if self.get(Constraint::NMtu) == Some(1) {
            must(proto + app + write <= mtu, "packet fits in MTU")?;
        }
        if let Some(framesize) = self.get(Constraint::FrameSize) {
            must(framesize > 0, "framesize > 0")?;
            must(framesize % 8 == 0, "framesize % 8 == 0")?;
            must(framesize % read == 0, "framesize % read_size == 0")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut sep = "";
        for (c, v) in &self.values {
            write!(f, "{}<{}:{}>", sep, c, v)?;
            sep = " ";
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Bytes after compressing `bytes` input bytes (identity without solution).
fn compressed_size(bytes: u32, solution: Option<&Solution>) -> Result<u32> {
    match solution {
        None => Ok(bytes),
        Some(s) => {
            if bytes % 8 != 0 {
                return Err(Error::Invalid(format!(
                    "compressed_size: {} not a multiple of 8",
                    bytes
                )));
            }
            Ok(s.output_words(bytes / 8) * 8)
        }
    }
}

/// Input bytes needed to produce `bytes` compressed output bytes.
fn uncompressed_size(bytes: u32, solution: Option<&Solution>) -> Result<u32> {
    match solution {
        None => Ok(bytes),
        Some(s) => {
            if bytes % 8 != 0 {
                return Err(Error::Invalid(format!(
                    "uncompressed_size: {} not a multiple of 8",
                    bytes
                )));
            }
            Ok(s.input_words(bytes / 8) * 8)
        }
    }
}

/// Seeds a constraint set from the network parameters. TCP-family protocols
/// leave `n_mtu` unconstrained (streaming); UDP-family pins one datagram per
/// MTU, and the sequence-numbered variants carry 8 bytes of application
/// overhead per datagram.
pub fn from_network(protocol: &str, mtu: u32, blocksize: u32) -> ConstraintSet {
    let mut set = ConstraintSet::new();
    let mut proto_overhead = 20; // IPv4
    let mut app_overhead = 0;
    if protocol.contains("tcp") {
        proto_overhead += 24;
    } else if protocol.contains("udp") || protocol.contains("udt") {
        proto_overhead += 8;
        set.set(Constraint::NMtu, 1);
        if protocol == "udps" || protocol == "udpsnor" {
            app_overhead = 8;
        }
    }
    set.set(Constraint::Mtu, mtu);
    set.set(Constraint::BlockSize, blocksize);
    set.set(Constraint::ProtocolOverhead, proto_overhead);
    set.set(Constraint::ApplicationOverhead, app_overhead);
    set
}

/// Full solver entry point: network parameters plus the optional frame
/// format and compression solution in effect for the transfer.
pub fn constrain(
    netparms: &NetParms,
    header: Option<&FrameDescriptor>,
    solution: Option<&Solution>,
) -> Result<ConstraintSet> {
    let mut set = from_network(
        &netparms.protocol(),
        netparms.mtu(),
        netparms.blocksize(),
    );
    if let Some(hdr) = header {
        // compression operates on whole frames only
        if solution.is_some() {
            set.set(Constraint::FrameSize, hdr.framesize);
            // the single Mark5B header covers all tracks; skip compressing it
            if hdr.format == FrameFormat::Mark5B {
                set.set(Constraint::CompressOffset, hdr.headersize);
            }
        }
        // VDIF over any UDP flavour travels as whole frames
        if hdr.format.is_vdif() && netparms.protocol().contains("udp") {
            set.set(Constraint::FrameSize, hdr.framesize);
        }
    }
    constrain_set(&set, solution)
}

/// Solves a raw constraint set.
pub fn constrain_set(input: &ConstraintSet, solution: Option<&Solution>) -> Result<ConstraintSet> {
    let mut set = input.clone();
    if set.get(Constraint::CompressOffset).is_none() || solution.is_none() {
        set.set(Constraint::CompressOffset, 0);
    }
    let solved = if set.get(Constraint::FrameSize).is_none() {
        constrain_by_blocksize(&set, solution)?
    } else {
        constrain_by_framesize(&set, solution)?
    };
    solved.validate()?;
    Ok(solved)
}

fn constrain_by_blocksize(
    input: &ConstraintSet,
    solution: Option<&Solution>,
) -> Result<ConstraintSet> {
    let mtu = input.require(Constraint::Mtu)?;
    let n_mtu = input.get(Constraint::NMtu);
    let proto = input.require(Constraint::ProtocolOverhead)?;
    let app = input.require(Constraint::ApplicationOverhead)?;
    let offset = input.require(Constraint::CompressOffset)?;
    let mut blocksize = input
        .get(Constraint::BlockSize)
        .ok_or_else(|| Error::Invalid("constraining by blocksize but it is unconstrained".into()))?;

    // one compression cycle, or one 8-byte word, is the least we can read
    let min_read = solution.map(|s| s.cycle() * 8).unwrap_or(8);
    if offset % 8 != 0 {
        return Err(Error::Invalid("compress_offset must be a multiple of 8".into()));
    }
    if blocksize < offset + min_read {
        return Err(Error::Invalid(format!(
            "blocksize {} smaller than compress_offset + minimum read {}",
            blocksize,
            offset + min_read
        )));
    }
    match n_mtu {
        None | Some(1) => (),
        Some(n) => return Err(Error::Invalid(format!("n_mtu {} not 1 or unconstrained", n))),
    }
    if n_mtu == Some(1) && mtu < proto + app + offset + 8 {
        return Err(Error::Unsatisfiable(format!("MTU too small: {}", input)));
    }

    let mut out = input.clone();
    if n_mtu.is_none() {
        // streaming: reads span any number of MTUs
        blocksize &= !0x7;
        let read = blocksize;
        let write = compressed_size(read - offset, solution)? + offset;
        out.set(Constraint::BlockSize, blocksize);
        out.set(Constraint::ReadSize, read);
        out.set(Constraint::WriteSize, write);
        return Ok(out);
    }

    // packet-based: walk the candidate write sizes downward until the
    // matching read size tiles the block
    let min_write = offset + compressed_size(min_read, solution)?;
    let mut write = (mtu - proto - app) & !0x7;
    while write >= min_write {
        let read = uncompressed_size(write - offset, solution)? + offset;
        if read <= blocksize {
            let trimmed = blocksize - blocksize % read;
            if trimmed > 0 && trimmed % 8 == 0 && read % 8 == 0 {
                out.set(Constraint::BlockSize, trimmed);
                out.set(Constraint::ReadSize, read);
                out.set(Constraint::WriteSize, write);
                return Ok(out);
            }
        }
        write -= 8;
    }
    Err(Error::Unsatisfiable(format!("{}", input)))
}

fn constrain_by_framesize(
    input: &ConstraintSet,
    solution: Option<&Solution>,
) -> Result<ConstraintSet> {
    let mtu = input.require(Constraint::Mtu)?;
    let n_mtu = input.get(Constraint::NMtu);
    let proto = input.require(Constraint::ProtocolOverhead)?;
    let app = input.require(Constraint::ApplicationOverhead)?;
    let offset = input.require(Constraint::CompressOffset)?;
    let blocksize = input.get(Constraint::BlockSize);
    let framesize = input.require(Constraint::FrameSize)?;

    if offset % 8 != 0 {
        return Err(Error::Invalid("compress_offset must be a multiple of 8".into()));
    }
    match n_mtu {
        None | Some(1) => (),
        Some(n) => return Err(Error::Invalid(format!("n_mtu {} not 1 or unconstrained", n))),
    }
    if framesize == 0 {
        return Err(Error::Invalid("constraining by framesize but it is zero".into()));
    }

    let mut out = input.clone();
    if n_mtu.is_none() {
        // streaming: read whole frames; find a blocksize commensurate with
        // the frame
        let mut bs = match blocksize {
            None => framesize,
            Some(b) => b & !0x7,
        };
        if bs == 0 {
            return Err(Error::Unsatisfiable(format!("{}", input)));
        }
        if bs > framesize {
            bs -= bs % framesize;
        } else if bs < framesize || framesize % bs != 0 {
            // largest divisor of framesize that fits bs, is a multiple of 8
            // and leaves room past the compress offset
            let mut i = framesize / bs;
            loop {
                if i >= framesize {
                    return Err(Error::Unsatisfiable(format!(
                        "no suitable blocksize for {}",
                        input
                    )));
                }
                bs = framesize / i;
                if framesize % bs == 0 && bs % 8 == 0 && bs > offset {
                    break;
                }
                i += 1;
            }
        }
        out.set(Constraint::BlockSize, bs);
        out.set(Constraint::ReadSize, framesize);
        out.set(
            Constraint::WriteSize,
            compressed_size(framesize - offset, solution)? + offset,
        );
        return Ok(out);
    }

    // packet-based with fixed frames: the read size must divide the frame
    // and the written payload must fit one datagram
    let mut found: Option<(u32, u32)> = None;
    for i in 1..framesize {
        if framesize % i != 0 {
            continue;
        }
        let read = framesize / i;
        if solution.is_some() && read % 8 != 0 {
            continue;
        }
        if read < offset {
            break;
        }
        let write = compressed_size(read - offset, solution)? + offset;
        let compress_gains = solution.is_none() || write < read;
        if proto + app + write <= mtu && compress_gains {
            found = Some((read, write));
            break;
        }
    }
    let (read, write) = found.ok_or_else(|| {
        if mtu <= proto + app {
            Error::Unsatisfiable(format!("MTU too small: {}", input))
        } else {
            Error::Unsatisfiable(format!("{}", input))
        }
    })?;

    // blocksize must tile with the frame: an integral number of frames per
    // block, or of blocks per frame
    let bs = match blocksize {
        None => framesize,
        Some(b) if b > framesize => b - b % framesize,
        Some(b) if b > read => {
            let mut bs = b - b % read;
            while bs / read > 1 && (bs % read != 0 || framesize % bs != 0) {
                bs -= read;
            }
            bs
        }
        Some(b) if b == read || b == framesize => b,
        Some(_) => {
            return Err(Error::Unsatisfiable(format!("blocksize too small: {}", input)));
        }
    };
    out.set(Constraint::BlockSize, bs);
    out.set(Constraint::ReadSize, read);
    out.set(Constraint::WriteSize, write);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackmask;

    fn get(set: &ConstraintSet, c: Constraint) -> u32 {
        set.get(c).unwrap()
    }

    #[test]
    fn tcp_streaming_passes_blocksize_through() {
        let input = from_network("tcp", 9000, 1_048_576);
        let solved = constrain_set(&input, None).unwrap();
        assert_eq!(get(&solved, Constraint::ReadSize), 1_048_576);
        assert_eq!(get(&solved, Constraint::WriteSize), 1_048_576);
        assert_eq!(get(&solved, Constraint::BlockSize), 1_048_576);
        assert_eq!(get(&solved, Constraint::ProtocolOverhead), 44);
        assert!(solved.get(Constraint::NMtu).is_none());
    }

    #[test]
    fn udps_with_frames_tiles_the_block() {
        let mut input = from_network("udps", 9000, 262_144);
        input.set(Constraint::FrameSize, 10_016);
        let solved = constrain_set(&input, None).unwrap();
        let read = get(&solved, Constraint::ReadSize);
        let write = get(&solved, Constraint::WriteSize);
        let blocksize = get(&solved, Constraint::BlockSize);
        assert_eq!(10_016 % read, 0);
        assert!(28 + 8 + write <= 9000); // proto + seqno + payload fits the MTU
        assert_eq!(read, 5008);
        assert_eq!(write, 5008);
        // an integral number of frames per block
        assert_eq!(blocksize % 10_016, 0);
        assert!(blocksize <= 262_144);
        assert_eq!(blocksize, 260_416);
    }

    #[test]
    fn udps_without_frames_fills_datagrams() {
        let input = from_network("udps", 9000, 262_144);
        let solved = constrain_set(&input, None).unwrap();
        let write = get(&solved, Constraint::WriteSize);
        let read = get(&solved, Constraint::ReadSize);
        assert_eq!(write, read);
        // 9000 - 28 - 8 truncated to a multiple of 8
        assert_eq!(write, 8960);
        assert_eq!(get(&solved, Constraint::BlockSize) % read, 0);
    }

    #[test]
    fn solver_is_idempotent() {
        for proto in &["tcp", "udps", "pudp"] {
            let input = from_network(proto, 9000, 1_048_576);
            let once = constrain_set(&input, None).unwrap();
            let twice = constrain_set(&once, None).unwrap();
            assert_eq!(once, twice, "{} not idempotent", proto);
        }
    }

    #[test]
    fn mtu_smaller_than_overheads_fails() {
        let input = from_network("udps", 36, 1_048_576);
        match constrain_set(&input, None) {
            Err(Error::Unsatisfiable(msg)) => assert!(msg.contains("MTU too small")),
            other => panic!("expected MTU failure, got {:?}", other.map(|s| s.to_string())),
        }
    }

    #[test]
    fn compression_shrinks_write_size() {
        // keep the top 32 of every 64 bits: 2 input words per output word
        let solution = trackmask::solve(0xffff_ffff_0000_0000).unwrap();
        let input = from_network("udps", 9000, 1_048_576);
        let solved = constrain_set(&input, Some(&solution)).unwrap();
        let read = get(&solved, Constraint::ReadSize);
        let write = get(&solved, Constraint::WriteSize);
        assert!(write < read);
        assert_eq!(write, read / 2);
        solved.validate().unwrap();
    }

    #[test]
    fn validate_rejects_torn_sets() {
        let mut set = from_network("tcp", 1500, 65536);
        set.set(Constraint::ReadSize, 1024);
        set.set(Constraint::WriteSize, 2048); // write > read
        set.set(Constraint::CompressOffset, 0);
        assert!(set.validate().is_err());
    }
}
