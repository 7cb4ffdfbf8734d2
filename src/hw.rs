//! Facades for the capture board and the disk array.
//!
//! The core never talks to vendor SDKs directly; transfers drive these
//! narrow traits instead. The disk-array driver is not thread-safe, so the
//! handle serializes every call behind one lock. Mock implementations back
//! the tests and the replay-only deployments that have no hardware at all.

use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("device not open")]
    NotOpen,
    #[error("device is write protected")]
    WriteProtected,
    #[error("bad channel {0}")]
    BadChannel(u32),
    #[error("device error: {0}")]
    Device(String),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// What the running system actually has plugged in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardwareFlags {
    pub mark5a: bool,
    pub mark5b_dim: bool,
    pub mark5b_dom: bool,
    pub mark5c: bool,
    pub amazon: bool,
    pub fpdp2: bool,
}

impl HardwareFlags {
    pub fn any_io_board(&self) -> bool {
        self.mark5a || self.mark5b_dim || self.mark5b_dom || self.mark5c
    }
}

/// Capture-board facade; one per runtime, process-wide single owner.
pub trait CaptureBoard: Send {
    fn flags(&self) -> HardwareFlags;
    fn setup(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Pulls captured samples off the board FIFO (the `in2net` data path).
    fn read_fifo(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Pushes replayed samples out through the board (`net2out`,
    /// `disk2out`).
    fn write_out(&mut self, buf: &[u8]) -> Result<usize>;
}

/// A capture board that is not there; every transfer that needs real
/// hardware fails cleanly.
#[derive(Debug, Default)]
pub struct NoBoard;

impl CaptureBoard for NoBoard {
    fn flags(&self) -> HardwareFlags {
        HardwareFlags::default()
    }

    fn setup(&mut self) -> Result<()> {
        Err(Error::Device("no capture board present".into()))
    }

    fn start(&mut self) -> Result<()> {
        Err(Error::Device("no capture board present".into()))
    }

    fn pause(&mut self) -> Result<()> {
        Err(Error::Device("no capture board present".into()))
    }

    fn resume(&mut self) -> Result<()> {
        Err(Error::Device("no capture board present".into()))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_fifo(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Device("no capture board present".into()))
    }

    fn write_out(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::Device("no capture board present".into()))
    }
}

/// Scripted board for tests: records the call sequence and produces a
/// deterministic byte ramp on its FIFO.
#[derive(Debug, Default)]
pub struct MockBoard {
    pub calls: Vec<&'static str>,
    pub running: bool,
    pub fifo_pos: u64,
    pub emitted: Vec<u8>,
}

impl CaptureBoard for MockBoard {
    fn flags(&self) -> HardwareFlags {
        HardwareFlags {
            mark5b_dim: true,
            ..HardwareFlags::default()
        }
    }

    fn setup(&mut self) -> Result<()> {
        self.calls.push("setup");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.calls.push("start");
        self.running = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.calls.push("pause");
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.calls.push("resume");
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.calls.push("stop");
        self.running = false;
        Ok(())
    }

    fn read_fifo(&mut self, buf: &mut [u8]) -> Result<usize> {
        for b in buf.iter_mut() {
            *b = self.fifo_pos as u8;
            self.fifo_pos += 1;
        }
        Ok(buf.len())
    }

    fn write_out(&mut self, buf: &[u8]) -> Result<usize> {
        self.emitted.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Shared, serialized handle to the capture board; the board is a
/// process-wide single-owner resource and its driver calls must not
/// overlap.
#[derive(Clone)]
pub struct CaptureBoardHandle {
    inner: Arc<Mutex<Box<dyn CaptureBoard>>>,
}

impl CaptureBoardHandle {
    pub fn new(board: Box<dyn CaptureBoard>) -> Self {
        CaptureBoardHandle {
            inner: Arc::new(Mutex::new(board)),
        }
    }

    pub fn none() -> Self {
        Self::new(Box::new(NoBoard))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut dyn CaptureBoard) -> Result<R>) -> Result<R> {
        let mut board = self.inner.lock().expect("capture board lock poisoned");
        f(board.as_mut())
    }
}

impl fmt::Debug for CaptureBoardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CaptureBoardHandle")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    Record,
    Playback,
    Passthrough,
}

/// Directory summary of the attached disk pack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectoryInfo {
    pub length: u64,
    pub full: bool,
    pub write_protected: bool,
}

/// Disk-array facade. Raw driver calls; serialization is the wrapper's
/// job, not the implementor's.
pub trait DiskArray: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn set_mode(&mut self, mode: IoMode) -> Result<()>;
    fn bind_input_channel(&mut self, channel: u32) -> Result<()>;
    fn bind_output_channel(&mut self, channel: u32) -> Result<()>;
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn directory(&self) -> Result<DirectoryInfo>;
    fn read_user_dir(&self) -> Result<Vec<u8>>;
    fn write_user_dir(&mut self, data: &[u8]) -> Result<()>;
    /// Reads `buf.len()` bytes of recorded data starting at `start`.
    fn playback(&self, start: u64, buf: &mut [u8]) -> Result<usize>;
    fn play_buffer_status(&self) -> Result<u64>;
}

/// Process-wide serialized handle: every driver call runs under one lock.
#[derive(Clone)]
pub struct DiskArrayHandle {
    inner: Arc<Mutex<Box<dyn DiskArray>>>,
}

impl DiskArrayHandle {
    pub fn new(device: Box<dyn DiskArray>) -> Self {
        DiskArrayHandle {
            inner: Arc::new(Mutex::new(device)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut dyn DiskArray) -> Result<R>) -> Result<R> {
        let mut dev = self.inner.lock().expect("disk array lock poisoned");
        f(dev.as_mut())
    }
}

impl fmt::Debug for DiskArrayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiskArrayHandle")
    }
}

/// In-memory disk array for tests and hardware-less deployments.
#[derive(Debug, Default)]
pub struct RamDiskArray {
    open: bool,
    mode: Option<IoMode>,
    pub data: Vec<u8>,
    user_dir: Vec<u8>,
    pub write_protected: bool,
    input_channel: Option<u32>,
    output_channel: Option<u32>,
}

impl RamDiskArray {
    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }
}

impl DiskArray for RamDiskArray {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn set_mode(&mut self, mode: IoMode) -> Result<()> {
        self.check_open()?;
        self.mode = Some(mode);
        Ok(())
    }

    fn bind_input_channel(&mut self, channel: u32) -> Result<()> {
        self.check_open()?;
        if channel > 1 {
            return Err(Error::BadChannel(channel));
        }
        self.input_channel = Some(channel);
        Ok(())
    }

    fn bind_output_channel(&mut self, channel: u32) -> Result<()> {
        self.check_open()?;
        if channel > 1 {
            return Err(Error::BadChannel(channel));
        }
        self.output_channel = Some(channel);
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if self.write_protected {
            return Err(Error::WriteProtected);
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn directory(&self) -> Result<DirectoryInfo> {
        self.check_open()?;
        Ok(DirectoryInfo {
            length: self.data.len() as u64,
            full: false,
            write_protected: self.write_protected,
        })
    }

    fn read_user_dir(&self) -> Result<Vec<u8>> {
        self.check_open()?;
        Ok(self.user_dir.clone())
    }

    fn write_user_dir(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if self.write_protected {
            return Err(Error::WriteProtected);
        }
        self.user_dir = data.to_vec();
        Ok(())
    }

    fn playback(&self, start: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let start = start.min(self.data.len() as u64) as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn play_buffer_status(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.data.len() as u64)
    }
}
