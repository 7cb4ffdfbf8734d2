//! On-disk scan directory of a disk pack.
//!
//! Successive SDK generations each invented their own binary layout; the
//! pack may carry any of them. The layouts supported here form a tagged
//! variant: the classic 1024-scan table, and the "enhanced" tables that
//! add an 8- or 16-character VSN label plus a companion VSN. A directory
//! blob is identified by its exact byte size; where two layouts share a
//! size, each candidate is scored for internal inconsistencies (the
//! "insanity score") and the least insane one wins.
//!
//! After every mutation the directory is mirrored to two human-readable
//! files; mirror failures are logged, never fatal.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("directory size {0} matches no known layout")]
    UnknownLayout(usize),
    #[error("scan index {0} out of range (have {1})")]
    BadIndex(usize, usize),
    #[error("scan directory is full")]
    Full,
    #[error("stale scan handle (directory changed since it was issued)")]
    StaleHandle,
    #[error("no scans to remove")]
    Empty,
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub const MAX_SCANS: usize = 1024;
const ENTRY_SIZE: usize = 48;
const NAME_SIZE: usize = 32;
const BASE_SIZE: usize = 4 + MAX_SCANS * ENTRY_SIZE + 8 + 8;
const ENHANCED_SIZE: usize = BASE_SIZE + 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutKind {
    /// classic layout: count, 1024 entries, record and play pointers
    Original,
    /// adds vsn[8] + companion[8] + 16 zero bytes of padding
    Vsn8,
    /// adds vsn[16] + companion[16]
    Vsn16,
}

impl LayoutKind {
    fn size(self) -> usize {
        match self {
            LayoutKind::Original => BASE_SIZE,
            LayoutKind::Vsn8 | LayoutKind::Vsn16 => ENHANCED_SIZE,
        }
    }

    fn candidates(size: usize) -> &'static [LayoutKind] {
        match size {
            BASE_SIZE => &[LayoutKind::Original],
            ENHANCED_SIZE => &[LayoutKind::Vsn8, LayoutKind::Vsn16],
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scan {
    pub name: String,
    pub start: u64,
    pub length: u64,
}

/// Writable slot obtained from [`ScanDir::next_scan`]; only valid against
/// the directory generation it was issued for.
#[derive(Clone, Copy, Debug)]
pub struct ScanHandle {
    index: usize,
    dir_id: u64,
}

static NEXT_DIR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct ScanDir {
    kind: LayoutKind,
    scans: Vec<Scan>,
    pub record_pointer: u64,
    pub play_pointer: u64,
    pub vsn: String,
    pub companion_vsn: String,
    dir_id: u64,
}

fn read_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_name(out: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
    for b in &mut out[n..] {
        *b = 0;
    }
}

fn printable_or_nul(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|&b| b == 0 || (0x20..0x7f).contains(&b))
}

impl ScanDir {
    pub fn new(kind: LayoutKind) -> Self {
        ScanDir {
            kind,
            scans: Vec::new(),
            record_pointer: 0,
            play_pointer: 0,
            vsn: String::new(),
            companion_vsn: String::new(),
            dir_id: NEXT_DIR_ID.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    /// Inconsistency count of `bytes` viewed as layout `kind`. Used to
    /// break detection ties; also handy as a corruption gauge.
    pub fn insanity_score(kind: LayoutKind, bytes: &[u8]) -> u32 {
        if bytes.len() != kind.size() {
            return u32::MAX;
        }
        let mut score = 0;
        let nscans = LittleEndian::read_u32(&bytes[0..4]) as usize;
        if nscans > MAX_SCANS {
            score += 1;
        }
        let n = nscans.min(MAX_SCANS);
        let mut prev_start = 0u64;
        for i in 0..n {
            let at = 4 + i * ENTRY_SIZE;
            let entry = &bytes[at..at + ENTRY_SIZE];
            if !printable_or_nul(&entry[..NAME_SIZE]) {
                score += 1;
            }
            if entry[0] == 0 {
                score += 1; // nameless scan
            }
            let start = LittleEndian::read_u64(&entry[NAME_SIZE..NAME_SIZE + 8]);
            let length = LittleEndian::read_u64(&entry[NAME_SIZE + 8..NAME_SIZE + 16]);
            if start < prev_start {
                score += 1; // out of order
            }
            if start.checked_add(length).is_none() {
                score += 1;
            }
            prev_start = start;
        }
        let tail = 4 + MAX_SCANS * ENTRY_SIZE;
        let record = LittleEndian::read_u64(&bytes[tail..tail + 8]);
        if let Some(last) = (n > 0).then(|| &bytes[4 + (n - 1) * ENTRY_SIZE..]) {
            let start = LittleEndian::read_u64(&last[NAME_SIZE..NAME_SIZE + 8]);
            let length = LittleEndian::read_u64(&last[NAME_SIZE + 8..NAME_SIZE + 16]);
            if start.saturating_add(length) > record.max(start) && record > 0 {
                score += 1; // scan extends past the record pointer
            }
        }
        match kind {
            LayoutKind::Original => (),
            LayoutKind::Vsn8 => {
                let extra = &bytes[tail + 16..];
                if !printable_or_nul(&extra[0..8]) {
                    score += 1;
                }
                if !printable_or_nul(&extra[8..16]) {
                    score += 1;
                }
                if extra[16..32].iter().any(|&b| b != 0) {
                    score += 2; // padding must stay zero
                }
            }
            LayoutKind::Vsn16 => {
                let extra = &bytes[tail + 16..];
                if !printable_or_nul(&extra[0..16]) {
                    score += 1;
                }
                if !printable_or_nul(&extra[16..32]) {
                    score += 1;
                }
            }
        }
        score
    }

    /// Decodes a directory blob, choosing the layout by size and, when
    /// several layouts share the size, by lowest insanity score.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let candidates = LayoutKind::candidates(bytes.len());
        let kind = match candidates {
            [] => return Err(Error::UnknownLayout(bytes.len())),
            [only] => *only,
            several => *several
                .iter()
                .min_by_key(|k| Self::insanity_score(**k, bytes))
                .expect("non-empty candidate list"),
        };
        let nscans = (LittleEndian::read_u32(&bytes[0..4]) as usize).min(MAX_SCANS);
        let mut scans = Vec::with_capacity(nscans);
        for i in 0..nscans {
            let at = 4 + i * ENTRY_SIZE;
            let entry = &bytes[at..at + ENTRY_SIZE];
            scans.push(Scan {
                name: read_name(&entry[..NAME_SIZE]),
                start: LittleEndian::read_u64(&entry[NAME_SIZE..NAME_SIZE + 8]),
                length: LittleEndian::read_u64(&entry[NAME_SIZE + 8..NAME_SIZE + 16]),
            });
        }
        let tail = 4 + MAX_SCANS * ENTRY_SIZE;
        let record_pointer = LittleEndian::read_u64(&bytes[tail..tail + 8]);
        let play_pointer = LittleEndian::read_u64(&bytes[tail + 8..tail + 16]);
        let (vsn, companion_vsn) = match kind {
            LayoutKind::Original => (String::new(), String::new()),
            LayoutKind::Vsn8 => {
                let extra = &bytes[tail + 16..];
                (read_name(&extra[0..8]), read_name(&extra[8..16]))
            }
            LayoutKind::Vsn16 => {
                let extra = &bytes[tail + 16..];
                (read_name(&extra[0..16]), read_name(&extra[16..32]))
            }
        };
        Ok(ScanDir {
            kind,
            scans,
            record_pointer,
            play_pointer,
            vsn,
            companion_vsn,
            dir_id: NEXT_DIR_ID.fetch_add(1, Ordering::SeqCst),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.kind.size()];
        LittleEndian::write_u32(&mut out[0..4], self.scans.len() as u32);
        for (i, scan) in self.scans.iter().enumerate() {
            let at = 4 + i * ENTRY_SIZE;
            let entry = &mut out[at..at + ENTRY_SIZE];
            write_name(&mut entry[..NAME_SIZE], &scan.name);
            LittleEndian::write_u64(&mut entry[NAME_SIZE..NAME_SIZE + 8], scan.start);
            LittleEndian::write_u64(&mut entry[NAME_SIZE + 8..NAME_SIZE + 16], scan.length);
        }
        let tail = 4 + MAX_SCANS * ENTRY_SIZE;
        LittleEndian::write_u64(&mut out[tail..tail + 8], self.record_pointer);
        LittleEndian::write_u64(&mut out[tail + 8..tail + 16], self.play_pointer);
        match self.kind {
            LayoutKind::Original => (),
            LayoutKind::Vsn8 => {
                let extra = &mut out[tail + 16..];
                write_name(&mut extra[0..8], &self.vsn);
                write_name(&mut extra[8..16], &self.companion_vsn);
            }
            LayoutKind::Vsn16 => {
                let extra = &mut out[tail + 16..];
                write_name(&mut extra[0..16], &self.vsn);
                write_name(&mut extra[16..32], &self.companion_vsn);
            }
        }
        out
    }

    pub fn n_scans(&self) -> usize {
        self.scans.len()
    }

    pub fn get_scan(&self, index: usize) -> Result<&Scan> {
        self.scans
            .get(index)
            .ok_or_else(|| Error::BadIndex(index, self.scans.len()))
    }

    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    /// Appends a blank scan and hands back a writable slot.
    pub fn next_scan(&mut self) -> Result<ScanHandle> {
        if self.scans.len() == MAX_SCANS {
            return Err(Error::Full);
        }
        self.scans.push(Scan {
            name: String::new(),
            start: self.record_pointer,
            length: 0,
        });
        Ok(ScanHandle {
            index: self.scans.len() - 1,
            dir_id: self.dir_id,
        })
    }

    /// Writes a scan's metadata back through its handle. The handle must
    /// still belong to this directory generation.
    pub fn set_scan(&mut self, handle: ScanHandle, scan: Scan) -> Result<()> {
        if handle.dir_id != self.dir_id {
            return Err(Error::StaleHandle);
        }
        let len = self.scans.len();
        let slot = self
            .scans
            .get_mut(handle.index)
            .ok_or(Error::BadIndex(handle.index, len))?;
        *slot = scan;
        Ok(())
    }

    pub fn clear_scans(&mut self) {
        self.scans.clear();
        self.bump_generation();
    }

    pub fn remove_last_scan(&mut self) -> Result<Scan> {
        let scan = self.scans.pop().ok_or(Error::Empty)?;
        self.bump_generation();
        Ok(scan)
    }

    /// After an unclean shutdown: grow the last scan to the recovered
    /// record pointer, or synthesize one covering everything recorded.
    pub fn recover(&mut self, record_pointer: u64) {
        self.record_pointer = record_pointer;
        match self.scans.last_mut() {
            Some(last) if last.start <= record_pointer => {
                last.length = record_pointer - last.start;
            }
            Some(_) => {
                log::warn!("last scan starts past the record pointer; synthesizing");
                self.scans.push(Scan {
                    name: "recovered scan".to_owned(),
                    start: 0,
                    length: record_pointer,
                });
            }
            None => self.scans.push(Scan {
                name: "recovered scan".to_owned(),
                start: 0,
                length: record_pointer,
            }),
        }
    }

    /// Clamps out-of-range fields without losing recoverable scans.
    pub fn sanitize(&mut self) {
        let record = self.record_pointer;
        for scan in &mut self.scans {
            if scan.name.is_empty() {
                scan.name = "unnamed scan".to_owned();
            }
            if record > 0 {
                if scan.start > record {
                    scan.start = record;
                }
                if scan.start.saturating_add(scan.length) > record {
                    scan.length = record - scan.start;
                }
            }
        }
        if self.play_pointer > record {
            self.play_pointer = record;
        }
    }

    fn bump_generation(&mut self) {
        self.dir_id = NEXT_DIR_ID.fetch_add(1, Ordering::SeqCst);
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "VSN: {}  companion: {}", self.vsn, self.companion_vsn);
        let _ = writeln!(
            out,
            "record: {}  play: {}  scans: {}",
            self.record_pointer,
            self.play_pointer,
            self.scans.len()
        );
        for (i, s) in self.scans.iter().enumerate() {
            let _ = writeln!(out, "{:4} {:32} {:>16} {:>16}", i, s.name, s.start, s.length);
        }
        out
    }

    /// Mirrors the directory to the fixed and the VSN-specific path under
    /// `base`. Failures are logged and swallowed.
    pub fn write_mirrors(&self, base: &Path) {
        let text = self.render();
        let fixed = base.join("scandir.txt");
        if let Err(e) = fs::write(&fixed, &text) {
            log::warn!("cannot write {}: {}", fixed.display(), e);
        }
        if !self.vsn.is_empty() {
            let per_vsn = base.join(format!("{}.dir", self.vsn));
            if let Err(e) = fs::write(&per_vsn, &text) {
                log::warn!("cannot write {}: {}", per_vsn.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn sample(kind: LayoutKind) -> ScanDir {
        let mut dir = ScanDir::new(kind);
        dir.vsn = "FLEX-001".to_owned();
        dir.companion_vsn = "FLEX-002".to_owned();
        let h = dir.next_scan().unwrap();
        dir.set_scan(
            h,
            Scan {
                name: "exp01_ef_no0001".to_owned(),
                start: 0,
                length: 1_000_000,
            },
        )
        .unwrap();
        let h = dir.next_scan().unwrap();
        dir.set_scan(
            h,
            Scan {
                name: "exp01_ef_no0002".to_owned(),
                start: 1_000_000,
                length: 500_000,
            },
        )
        .unwrap();
        dir.record_pointer = 1_500_000;
        dir
    }

    #[test]
    fn roundtrip_every_layout() {
        for kind in &[LayoutKind::Original, LayoutKind::Vsn8, LayoutKind::Vsn16] {
            let dir = sample(*kind);
            let bytes = dir.encode();
            assert_eq!(bytes.len(), kind.size());
            let back = ScanDir::decode(&bytes).unwrap();
            assert_eq!(back.kind(), *kind, "layout {:?}", kind);
            assert_eq!(back.scans(), dir.scans());
            assert_eq!(back.record_pointer, 1_500_000);
            if *kind != LayoutKind::Original {
                assert_eq!(back.vsn, "FLEX-001");
                assert_eq!(back.companion_vsn, "FLEX-002");
            }
        }
    }

    #[test]
    fn ambiguous_size_resolved_by_insanity() {
        // Vsn16 with a long VSN: read as Vsn8 the padding bytes are
        // non-zero, which the Vsn8 view counts heavily against
        let mut dir = sample(LayoutKind::Vsn16);
        dir.vsn = "LONGLABEL1234567".to_owned();
        dir.companion_vsn = "OTHERLABEL123456".to_owned();
        let bytes = dir.encode();
        assert!(
            ScanDir::insanity_score(LayoutKind::Vsn8, &bytes)
                > ScanDir::insanity_score(LayoutKind::Vsn16, &bytes)
        );
        assert_eq!(ScanDir::decode(&bytes).unwrap().kind(), LayoutKind::Vsn16);
    }

    #[test]
    fn unknown_size_is_rejected() {
        match ScanDir::decode(&[0u8; 123]) {
            Err(Error::UnknownLayout(123)) => (),
            other => panic!("unexpected: {:?}", other.map(|d| d.kind())),
        }
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut dir = sample(LayoutKind::Original);
        let h = dir.next_scan().unwrap();
        dir.clear_scans();
        assert_eq!(
            dir.set_scan(
                h,
                Scan {
                    name: "x".into(),
                    start: 0,
                    length: 0
                }
            ),
            Err(Error::StaleHandle)
        );
    }

    #[test]
    fn recover_extends_last_scan() {
        let mut dir = sample(LayoutKind::Original);
        dir.recover(2_000_000);
        let last = dir.get_scan(dir.n_scans() - 1).unwrap();
        assert_eq!(last.start, 1_000_000);
        assert_eq!(last.length, 1_000_000);
    }

    #[test]
    fn recover_on_empty_synthesizes_scan() {
        let mut dir = ScanDir::new(LayoutKind::Vsn8);
        dir.recover(777);
        assert_eq!(dir.n_scans(), 1);
        let scan = dir.get_scan(0).unwrap();
        assert_eq!(scan.name, "recovered scan");
        assert_eq!((scan.start, scan.length), (0, 777));
        // recovery round-trips through the binary layout
        let back = ScanDir::decode(&dir.encode()).unwrap();
        assert_eq!(back.scans(), dir.scans());
    }

    #[test]
    fn sanitize_clamps_out_of_range() {
        let mut dir = sample(LayoutKind::Original);
        dir.record_pointer = 1_200_000;
        dir.play_pointer = 9_999_999;
        dir.sanitize();
        let last = dir.get_scan(1).unwrap();
        assert_eq!(last.start + last.length, 1_200_000);
        assert_eq!(dir.play_pointer, 1_200_000);
        assert_eq!(dir.n_scans(), 2);
    }

    #[test]
    fn remove_and_clear() {
        let mut dir = sample(LayoutKind::Original);
        let gone = dir.remove_last_scan().unwrap();
        assert_eq!(gone.name, "exp01_ef_no0002");
        assert_eq!(dir.n_scans(), 1);
        dir.clear_scans();
        assert_eq!(dir.n_scans(), 0);
        assert_eq!(dir.remove_last_scan(), Err(Error::Empty));
    }

    #[test]
    fn mirrors_are_written() {
        let tmp = TempDir::new("userdir").unwrap();
        let dir = sample(LayoutKind::Vsn8);
        dir.write_mirrors(tmp.path());
        let fixed = fs::read_to_string(tmp.path().join("scandir.txt")).unwrap();
        assert!(fixed.contains("exp01_ef_no0001"));
        let per_vsn = fs::read_to_string(tmp.path().join("FLEX-001.dir")).unwrap();
        assert_eq!(fixed, per_vsn);
        // a missing mirror directory must not fail the caller
        dir.write_mirrors(Path::new("/nonexistent/location"));
    }
}
