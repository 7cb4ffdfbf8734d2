//! Striped virtual-file layer.
//!
//! A recording `S` lives as chunk files `<mount>/S/S.NNNNNNNN` scattered
//! over many mountpoints (the flexbuff layout), or as Mark6 container
//! files `<mount>/S` holding framed write-blocks. This layer locates all
//! pieces in parallel, sorts them by chunk number, and presents the whole
//! recording as one seekable byte stream behind an integer handle chosen
//! so it can never collide with a kernel file descriptor.
//!
//! Handles live in a process-wide map behind a reader/writer lock:
//! `open`/`close` take the writer side, `read`/`seek` the reader side.
//! A single handle is meant for one reader at a time.

use crate::writer::{Mark6BlockHeader, Mark6FileHeader};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such recording: {0}")]
    NoSuchRecording(String),
    #[error("bad recording handle {0}")]
    BadHandle(i32),
    #[error("invalid seek to {0}")]
    InvalidSeek(i64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One piece of a recording: a whole flexbuff chunk file, or one framed
/// block inside a Mark6 container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub path: PathBuf,
    /// where the payload starts within the file
    pub file_offset: u64,
    pub size: u64,
    pub number: u32,
    /// byte offset within the assembled recording; prefix sum of sizes
    pub offset: u64,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Parses `S.NNNNNNNN`; the suffix is 8 decimal digits, leading zeros and
/// all (base 10 explicitly, lest `00000010` read as octal 8).
fn chunk_number(file_name: &str, recording: &str) -> Option<u32> {
    let suffix = file_name
        .strip_prefix(recording)
        .and_then(|s| s.strip_prefix('.'))?;
    if suffix.len() != 8 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    u32::from_str_radix(suffix, 10).ok()
}

fn scan_flexbuff(root: &Path, recording: &str) -> Vec<Chunk> {
    let dir = root.join(recording);
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    let mut chunks = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let number = match chunk_number(&name.to_string_lossy(), recording) {
            Some(n) => n,
            None => continue,
        };
        match entry.metadata() {
            Ok(md) if md.is_file() => chunks.push(Chunk {
                path: entry.path(),
                file_offset: 0,
                size: md.len(),
                number,
                offset: 0,
            }),
            Ok(_) => (),
            Err(e) => log::warn!("cannot stat {}: {}", entry.path().display(), e),
        }
    }
    chunks
}

fn scan_mark6(root: &Path, recording: &str) -> Vec<Chunk> {
    let path = root.join(recording);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let header = match Mark6FileHeader::read(&mut file) {
        Ok(h) => h,
        Err(_) => return Vec::new(), // not a Mark6 container
    };
    log::debug!(
        "{}: Mark6 container, block_size {}",
        path.display(),
        header.block_size
    );
    let mut chunks = Vec::new();
    let mut pos = Mark6FileHeader::SIZE as u64;
    loop {
        let wb = match Mark6BlockHeader::read(&mut file) {
            Ok(wb) => wb,
            Err(_) => break, // clean EOF or trailing garbage
        };
        let payload = wb.payload_len();
        chunks.push(Chunk {
            path: path.clone(),
            file_offset: pos + Mark6BlockHeader::SIZE as u64,
            size: payload,
            number: wb.block_num as u32,
            offset: 0,
        });
        pos += Mark6BlockHeader::SIZE as u64 + payload;
        if file.seek(SeekFrom::Start(pos)).is_err() {
            break;
        }
    }
    chunks
}

/// Locates all chunks of `recording` under `roots`, one worker per root.
/// A root that cannot be scanned is logged and skipped; the result is
/// sorted by chunk number with offsets assigned as prefix sums.
pub fn find_recording_chunks(recording: &str, roots: &[PathBuf]) -> Vec<Chunk> {
    let merged: Mutex<Vec<Chunk>> = Mutex::new(Vec::new());
    crossbeam::thread::scope(|s| {
        for root in roots {
            let merged = &merged;
            s.spawn(move |_| {
                let mut found = scan_flexbuff(root, recording);
                found.extend(scan_mark6(root, recording));
                merged.lock().expect("chunk merge lock").extend(found);
            });
        }
    })
    .expect("chunk scan worker panicked");
    let mut chunks = merged.into_inner().expect("chunk merge lock");
    chunks.sort_by(|a, b| (a.number, &a.path).cmp(&(b.number, &b.path)));
    let mut offset = 0;
    for c in &mut chunks {
        c.offset = offset;
        offset += c.size;
    }
    chunks
}

struct OpenRecording {
    chunks: Vec<Chunk>,
    total: u64,
    pos: u64,
    current: usize,
    fd: Option<File>,
}

impl OpenRecording {
    /// Index of the chunk containing `pos`, or the chunk count at EOF.
    fn chunk_at(&self, pos: u64) -> usize {
        match self
            .chunks
            .binary_search_by(|c| {
                use std::cmp::Ordering::*;
                if pos < c.offset {
                    Greater
                } else if pos >= c.end() {
                    Less
                } else {
                    Equal
                }
            }) {
            Ok(i) => i,
            Err(_) => self.chunks.len(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() && self.pos < self.total {
            let idx = self.chunk_at(self.pos);
            if idx >= self.chunks.len() {
                break;
            }
            if idx != self.current {
                self.fd = None; // moved off the previous chunk
                self.current = idx;
            }
            let chunk = &self.chunks[idx];
            if self.fd.is_none() {
                self.fd = Some(File::open(&chunk.path)?);
            }
            let fd = self.fd.as_mut().expect("chunk fd just opened");
            let within = self.pos - chunk.offset;
            fd.seek(SeekFrom::Start(chunk.file_offset + within))?;
            let n2r = ((chunk.end() - self.pos) as usize).min(buf.len() - done);
            let got = fd.read(&mut buf[done..done + n2r])?;
            if got == 0 {
                break; // chunk shorter on disk than advertised
            }
            done += got;
            self.pos += got as u64;
        }
        Ok(done)
    }

    fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let target: i64 = match from {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.total as i64 + d,
        };
        if target < 0 {
            return Err(Error::InvalidSeek(target));
        }
        self.pos = (target as u64).min(self.total);
        Ok(self.pos)
    }
}

lazy_static! {
    static ref OPEN: RwLock<HashMap<i32, Mutex<OpenRecording>>> = RwLock::new(HashMap::new());
}

// Handed out downward from here; far above any real file descriptor.
static NEXT_HANDLE: AtomicI32 = AtomicI32::new(0x4000_0000);

/// Opens a recording spread over `roots`. Fails if no chunk exists.
pub fn open(recording: &str, roots: &[PathBuf]) -> Result<i32> {
    let chunks = find_recording_chunks(recording, roots);
    if chunks.is_empty() {
        return Err(Error::NoSuchRecording(recording.to_owned()));
    }
    let total = chunks.iter().map(|c| c.size).sum();
    let handle = NEXT_HANDLE.fetch_sub(1, Ordering::SeqCst);
    OPEN.write().expect("recording map lock").insert(
        handle,
        Mutex::new(OpenRecording {
            chunks,
            total,
            pos: 0,
            current: usize::MAX,
            fd: None,
        }),
    );
    log::debug!("open recording `{}' as handle {}", recording, handle);
    Ok(handle)
}

pub fn total_size(handle: i32) -> Result<u64> {
    let map = OPEN.read().expect("recording map lock");
    let rec = map.get(&handle).ok_or(Error::BadHandle(handle))?;
    let total = rec.lock().expect("recording lock").total;
    Ok(total)
}

/// Reads up to `buf.len()` bytes at the current position; short reads only
/// at end of recording. A zero-length buffer reads zero bytes.
pub fn read(handle: i32, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let map = OPEN.read().expect("recording map lock");
    let rec = map.get(&handle).ok_or(Error::BadHandle(handle))?;
    let result = rec.lock().expect("recording lock").read(buf);
    result
}

/// POSIX lseek semantics, clipped to `[0, total_size]`.
pub fn seek(handle: i32, from: SeekFrom) -> Result<u64> {
    let map = OPEN.read().expect("recording map lock");
    let rec = map.get(&handle).ok_or(Error::BadHandle(handle))?;
    let result = rec.lock().expect("recording lock").seek(from);
    result
}

/// Releases the handle and every per-chunk descriptor.
pub fn close(handle: i32) -> Result<()> {
    let mut map = OPEN.write().expect("recording map lock");
    map.remove(&handle)
        .map(|_| ())
        .ok_or(Error::BadHandle(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempdir::TempDir;

    fn write_chunk(root: &Path, rec: &str, num: u32, data: &[u8]) {
        let dir = root.join(rec);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.{:08}", rec, num)), data).unwrap();
    }

    #[test]
    fn chunk_names_parse_base_ten() {
        assert_eq!(chunk_number("scan.00000010", "scan"), Some(10));
        assert_eq!(chunk_number("scan.00000000", "scan"), Some(0));
        assert_eq!(chunk_number("scan.0000001", "scan"), None);
        assert_eq!(chunk_number("scan.00O00001", "scan"), None);
        assert_eq!(chunk_number("other.00000001", "scan"), None);
    }

    #[test]
    fn chunks_sort_and_prefix_sum() {
        let tmp = TempDir::new("vbs").unwrap();
        write_chunk(tmp.path(), "exp01", 2, &[2u8; 30]);
        write_chunk(tmp.path(), "exp01", 0, &[0u8; 10]);
        write_chunk(tmp.path(), "exp01", 1, &[1u8; 20]);
        let chunks = find_recording_chunks("exp01", &[tmp.path().to_owned()]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| (c.number, c.offset, c.size)).collect::<Vec<_>>(),
            vec![(0, 0, 10), (1, 10, 20), (2, 30, 30)]
        );
    }

    #[test]
    fn read_crosses_chunk_boundaries() {
        let tmp = TempDir::new("vbs").unwrap();
        write_chunk(tmp.path(), "scan", 0, b"hello ");
        write_chunk(tmp.path(), "scan", 1, b"striped ");
        write_chunk(tmp.path(), "scan", 2, b"world");
        let h = open("scan", &[tmp.path().to_owned()]).unwrap();
        let mut buf = vec![0u8; 64];
        let n = read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello striped world");
        // at EOF further reads return 0
        assert_eq!(read(h, &mut buf).unwrap(), 0);
        close(h).unwrap();
    }

    #[test]
    fn two_mountpoint_stripe_with_duplicate_numbers() {
        // both mounts carry a chunk 0 and a chunk 1; all four pieces count
        let tmp = TempDir::new("vbs").unwrap();
        let (m1, m2) = (tmp.path().join("m1"), tmp.path().join("m2"));
        let big = 10 * 1024 * 1024;
        let small = 5 * 1024 * 1024;
        write_chunk(&m1, "scanA", 0, &vec![b'a'; big]);
        write_chunk(&m2, "scanA", 0, &vec![b'b'; big]);
        write_chunk(&m1, "scanA", 1, &vec![b'c'; small]);
        write_chunk(&m2, "scanA", 1, &vec![b'd'; small]);
        let h = open("scanA", &[m1, m2]).unwrap();
        assert_eq!(total_size(h).unwrap(), (2 * big + 2 * small) as u64);
        // first byte of the second chunk
        assert_eq!(seek(h, SeekFrom::Start(big as u64)).unwrap(), big as u64);
        let mut one = [0u8; 1];
        assert_eq!(read(h, &mut one).unwrap(), 1);
        assert_eq!(one[0], b'b');
        close(h).unwrap();
    }

    #[test]
    fn seek_is_clamped_and_rejects_negative() {
        let tmp = TempDir::new("vbs").unwrap();
        write_chunk(tmp.path(), "s", 0, &[9u8; 100]);
        let h = open("s", &[tmp.path().to_owned()]).unwrap();
        assert_eq!(seek(h, SeekFrom::End(50)).unwrap(), 100);
        assert!(matches!(
            seek(h, SeekFrom::Current(-200)),
            Err(Error::InvalidSeek(_))
        ));
        assert_eq!(seek(h, SeekFrom::Start(40)).unwrap(), 40);
        let mut buf = [0u8; 4];
        assert_eq!(read(h, &mut buf).unwrap(), 4);
        close(h).unwrap();
    }

    #[test]
    fn zero_length_read_returns_zero() {
        let tmp = TempDir::new("vbs").unwrap();
        write_chunk(tmp.path(), "s", 0, b"xyz");
        let h = open("s", &[tmp.path().to_owned()]).unwrap();
        assert_eq!(read(h, &mut []).unwrap(), 0);
        close(h).unwrap();
    }

    #[test]
    fn missing_recording_fails_open() {
        let tmp = TempDir::new("vbs").unwrap();
        match open("nothing", &[tmp.path().to_owned()]) {
            Err(Error::NoSuchRecording(name)) => assert_eq!(name, "nothing"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(find_recording_chunks("nothing", &[]).is_empty());
    }

    #[test]
    fn handles_do_not_collide() {
        let tmp = TempDir::new("vbs").unwrap();
        write_chunk(tmp.path(), "s", 0, b"abc");
        let h1 = open("s", &[tmp.path().to_owned()]).unwrap();
        let h2 = open("s", &[tmp.path().to_owned()]).unwrap();
        assert_ne!(h1, h2);
        assert!(h1 > 0x3000_0000 && h2 > 0x3000_0000);
        close(h1).unwrap();
        close(h2).unwrap();
        assert!(matches!(close(h1), Err(Error::BadHandle(_))));
    }
}
