//! Recording writer: stripes incoming blocks over the mountpoint set.
//!
//! Two on-disk layouts are produced. The flexbuff layout stores every
//! block as its own chunk file `<rec>/<rec>.NNNNNNNN`; the Mark6 layout
//! appends framed write-blocks to one container file per mountpoint,
//! each starting with the five-word Mark6 header. Block numbers increase
//! monotonically per stream but are not consecutive within one container,
//! since consecutive blocks land on different mountpoints.
//!
//! Mountpoint assignment is a pure function of `(mountpoints, stream,
//! sequence number)` so the virtual-file layer can always reassemble a
//! stream, and a writer restarted mid-recording keeps the same placement.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fnv::FnvHasher;
use fs2::FileExt;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no mountpoints configured")]
    NoMountpoints,
    #[error("recording `{0}' is locked by another writer")]
    Locked(String),
    #[error("not a Mark6 container (sync {0:#010x})")]
    BadSync(u32),
    #[error("unsupported Mark6 version {0}")]
    BadVersion(i32),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub const MARK6_SYNC: u32 = 0xfeed_6666;
pub const MARK6_VERSION: i32 = 2;

/// Five little-endian 32-bit words at the start of every Mark6 container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark6FileHeader {
    pub block_size: i32,
    pub packet_format: i32,
    pub packet_size: i32,
}

impl Mark6FileHeader {
    pub const SIZE: usize = 20;

    pub fn read(mut r: impl Read) -> Result<Self> {
        let sync = r.read_u32::<LittleEndian>()?;
        if sync != MARK6_SYNC {
            return Err(Error::BadSync(sync));
        }
        let version = r.read_i32::<LittleEndian>()?;
        if version != MARK6_VERSION {
            return Err(Error::BadVersion(version));
        }
        Ok(Mark6FileHeader {
            block_size: r.read_i32::<LittleEndian>()?,
            packet_format: r.read_i32::<LittleEndian>()?,
            packet_size: r.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write(&self, mut w: impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(MARK6_SYNC)?;
        w.write_i32::<LittleEndian>(MARK6_VERSION)?;
        w.write_i32::<LittleEndian>(self.block_size)?;
        w.write_i32::<LittleEndian>(self.packet_format)?;
        w.write_i32::<LittleEndian>(self.packet_size)?;
        Ok(())
    }
}

/// Per-block framing inside a Mark6 container: block number plus the block
/// length including this header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark6BlockHeader {
    pub block_num: i32,
    pub wb_size: i32,
}

impl Mark6BlockHeader {
    pub const SIZE: usize = 8;

    pub fn read(mut r: impl Read) -> Result<Self> {
        Ok(Mark6BlockHeader {
            block_num: r.read_i32::<LittleEndian>()?,
            wb_size: r.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write(&self, mut w: impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.block_num)?;
        w.write_i32::<LittleEndian>(self.wb_size)?;
        Ok(())
    }

    pub fn payload_len(&self) -> u64 {
        (self.wb_size as u64).saturating_sub(Self::SIZE as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingLayout {
    Flexbuff,
    Mark6,
}

/// Stream name: the bare recording, or `<rec>_ds<suffix>` when a
/// datastream mapping splits the input.
fn stream_name(recording: &str, suffix: Option<u32>) -> String {
    match suffix {
        None => recording.to_owned(),
        Some(ds) => format!("{}_ds{}", recording, ds),
    }
}

/// Deterministic mountpoint choice for a chunk.
pub fn pick_mountpoint<'a>(
    mounts: &'a [PathBuf],
    stream: &str,
    seq: u32,
) -> Option<&'a PathBuf> {
    if mounts.is_empty() {
        return None;
    }
    let mut h = FnvHasher::default();
    h.write(stream.as_bytes());
    let spread = (h.finish() % mounts.len() as u64) as usize;
    Some(&mounts[(seq as usize + spread) % mounts.len()])
}

struct StreamState {
    next_seq: u32,
}

/// Writes a recording's blocks across the mountpoint set.
pub struct ChunkStore {
    recording: String,
    layout: RecordingLayout,
    mountpoints: Vec<PathBuf>,
    mark6_header: Mark6FileHeader,
    streams: Mutex<HashMap<Option<u32>, StreamState>>,
    /// one container file per (mountpoint, stream), opened on first write
    containers: Mutex<HashMap<PathBuf, File>>,
    _lock: File,
}

impl ChunkStore {
    /// Creates a store for `recording`. An exclusive lock file on the first
    /// mountpoint keeps two writers off the same recording.
    pub fn create(
        recording: &str,
        layout: RecordingLayout,
        mountpoints: Vec<PathBuf>,
        mark6_header: Mark6FileHeader,
    ) -> Result<Self> {
        let first = mountpoints.first().ok_or(Error::NoMountpoints)?;
        let lock = File::create(first.join(format!(".{}.lock", recording)))?;
        lock.try_lock_exclusive()
            .map_err(|_| Error::Locked(recording.to_owned()))?;
        Ok(ChunkStore {
            recording: recording.to_owned(),
            layout,
            mountpoints,
            mark6_header,
            streams: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            _lock: lock,
        })
    }

    pub fn recording(&self) -> &str {
        &self.recording
    }

    fn next_seq(&self, suffix: Option<u32>) -> u32 {
        let mut streams = self.streams.lock().expect("stream counter lock");
        let state = streams
            .entry(suffix)
            .or_insert(StreamState { next_seq: 0 });
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Stores one block; `suffix` selects the datastream, if any. Returns
    /// the sequence number the block was filed under.
    pub fn store(&self, suffix: Option<u32>, data: &[u8]) -> Result<u32> {
        let seq = self.next_seq(suffix);
        let stream = stream_name(&self.recording, suffix);
        let mount = pick_mountpoint(&self.mountpoints, &stream, seq)
            .ok_or(Error::NoMountpoints)?;
        match self.layout {
            RecordingLayout::Flexbuff => {
                let dir = mount.join(&stream);
                fs::create_dir_all(&dir)?;
                let path = dir.join(format!("{}.{:08}", stream, seq));
                let mut f = File::create(&path)?;
                f.write_all(data)?;
                log::debug!("chunk {} -> {}", seq, path.display());
            }
            RecordingLayout::Mark6 => {
                let path = mount.join(&stream);
                let mut containers = self.containers.lock().expect("container lock");
                let file = match containers.entry(path.clone()) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(v) => {
                        let mut f = OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&path)?;
                        if f.metadata()?.len() == 0 {
                            self.mark6_header.write(&mut f)?;
                        }
                        v.insert(f)
                    }
                };
                Mark6BlockHeader {
                    block_num: seq as i32,
                    wb_size: (data.len() + Mark6BlockHeader::SIZE) as i32,
                }
                .write(&mut *file)?;
                file.write_all(data)?;
                log::debug!("block {} -> {}", seq, path.display());
            }
        }
        Ok(seq)
    }

    /// Stores a tagged block on its datastream: the tag becomes the
    /// `_ds<suffix>` and the stream keeps its own sequence counter.
    pub fn store_tagged(&self, block: &crate::block::TaggedBlock) -> Result<u32> {
        self.store(Some(block.tag), &block.block)
    }

    /// Flushes all open container files.
    pub fn sync(&self) -> Result<()> {
        let containers = self.containers.lock().expect("container lock");
        for f in containers.values() {
            f.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbs;
    use std::path::Path;
    use tempdir::TempDir;

    fn mounts(tmp: &Path, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let m = tmp.join(format!("m{}", i));
                fs::create_dir_all(&m).unwrap();
                m
            })
            .collect()
    }

    fn default_header() -> Mark6FileHeader {
        Mark6FileHeader {
            block_size: 10_000_008,
            packet_format: 0,
            packet_size: 10_000,
        }
    }

    #[test]
    fn flexbuff_chunks_are_named_and_spread() {
        let tmp = TempDir::new("writer").unwrap();
        let mounts = mounts(tmp.path(), 3);
        let store = ChunkStore::create(
            "rec",
            RecordingLayout::Flexbuff,
            mounts.clone(),
            default_header(),
        )
        .unwrap();
        for i in 0..9u8 {
            store.store(None, &[i; 64]).unwrap();
        }
        // every chunk is findable at its deterministic mountpoint
        for seq in 0..9u32 {
            let mount = pick_mountpoint(&mounts, "rec", seq).unwrap();
            let path = mount.join("rec").join(format!("rec.{:08}", seq));
            assert!(path.is_file(), "missing {}", path.display());
        }
        // and the virtual-file layer reassembles them in order
        let h = vbs::open("rec", &mounts).unwrap();
        let mut buf = vec![0u8; 9 * 64];
        assert_eq!(vbs::read(h, &mut buf).unwrap(), buf.len());
        for (i, piece) in buf.chunks(64).enumerate() {
            assert!(piece.iter().all(|&b| b == i as u8));
        }
        vbs::close(h).unwrap();
    }

    #[test]
    fn mark6_containers_carry_header_and_all_blocknums() {
        let tmp = TempDir::new("writer").unwrap();
        let mounts = mounts(tmp.path(), 2);
        let store = ChunkStore::create(
            "rec",
            RecordingLayout::Mark6,
            mounts.clone(),
            default_header(),
        )
        .unwrap();
        let sizes = [10usize << 20, 10 << 20, 9 << 20];
        for (i, size) in sizes.iter().enumerate() {
            store.store(None, &vec![i as u8; *size]).unwrap();
        }
        store.sync().unwrap();

        let mut all_nums = Vec::new();
        let mut containers = 0;
        for m in &mounts {
            let path = m.join("rec");
            if !path.is_file() {
                continue;
            }
            containers += 1;
            let mut f = File::open(&path).unwrap();
            let hdr = Mark6FileHeader::read(&mut f).unwrap();
            assert_eq!(hdr, default_header());
            loop {
                let wb = match Mark6BlockHeader::read(&mut f) {
                    Ok(wb) => wb,
                    Err(_) => break,
                };
                let mut payload = vec![0u8; wb.payload_len() as usize];
                f.read_exact(&mut payload).unwrap();
                assert!(payload.iter().all(|&b| b == wb.block_num as u8));
                all_nums.push(wb.block_num);
            }
        }
        assert_eq!(containers, 2);
        all_nums.sort_unstable();
        assert_eq!(all_nums, vec![0, 1, 2]);
    }

    #[test]
    fn mark6_recording_readable_through_vbs() {
        let tmp = TempDir::new("writer").unwrap();
        let mounts = mounts(tmp.path(), 2);
        let store = ChunkStore::create(
            "m6rec",
            RecordingLayout::Mark6,
            mounts.clone(),
            default_header(),
        )
        .unwrap();
        store.store(None, b"alpha-").unwrap();
        store.store(None, b"beta-").unwrap();
        store.store(None, b"gamma").unwrap();
        store.sync().unwrap();
        let h = vbs::open("m6rec", &mounts).unwrap();
        let mut buf = vec![0u8; 32];
        let n = vbs::read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"alpha-beta-gamma");
        vbs::close(h).unwrap();
    }

    #[test]
    fn datastreams_get_own_names_and_counters() {
        let tmp = TempDir::new("writer").unwrap();
        let mounts = mounts(tmp.path(), 2);
        let store = ChunkStore::create(
            "rec",
            RecordingLayout::Flexbuff,
            mounts.clone(),
            default_header(),
        )
        .unwrap();
        store.store(Some(1), b"one").unwrap();
        store.store(Some(2), b"two").unwrap();
        assert_eq!(store.store(Some(1), b"more").unwrap(), 1);
        assert_eq!(store.store(None, b"plain").unwrap(), 0);
        // tagged blocks route through their tag's stream counter
        let tagged = crate::block::TaggedBlock {
            tag: 2,
            block: crate::block::Block::from_vec(b"again".to_vec()),
        };
        assert_eq!(store.store_tagged(&tagged).unwrap(), 1);
        let ds1 = vbs::find_recording_chunks("rec_ds1", &mounts);
        let ds2 = vbs::find_recording_chunks("rec_ds2", &mounts);
        assert_eq!(ds1.len(), 2);
        assert_eq!(ds2.len(), 2);
    }

    #[test]
    fn second_writer_is_locked_out() {
        let tmp = TempDir::new("writer").unwrap();
        let mounts = mounts(tmp.path(), 1);
        let _store = ChunkStore::create(
            "rec",
            RecordingLayout::Flexbuff,
            mounts.clone(),
            default_header(),
        )
        .unwrap();
        assert!(matches!(
            ChunkStore::create("rec", RecordingLayout::Flexbuff, mounts, default_header()),
            Err(Error::Locked(_))
        ));
    }
}
