//! The per-transfer runtime: one mutable container holding everything an
//! active transfer needs, behind one lock.
//!
//! Command handlers clone the [`Runtime`] handle freely; the inner state
//! is taken under the runtime mutex for the duration of a command, while
//! statistics counters are atomics the data path updates lock-free.

use crate::chain::Chain;
use crate::constraints::ConstraintSet;
use crate::datastream::DataStreams;
use crate::frame::FrameDescriptor;
use crate::hw::{CaptureBoardHandle, DiskArrayHandle};
use crate::net::NetParms;
use crate::trackmask::Solution;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    NoTransfer,
    Disk2Net,
    Disk2NetVbs,
    File2Net,
    Fill2Net,
    Disk2Out,
    DiskFill2File,
    In2Disk,
    In2Net,
    Net2Out,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferMode::NoTransfer => "no_transfer",
            TransferMode::Disk2Net => "disk2net",
            TransferMode::Disk2NetVbs => "disk2net_vbs",
            TransferMode::File2Net => "file2net",
            TransferMode::Fill2Net => "fill2net",
            TransferMode::Disk2Out => "disk2out",
            TransferMode::DiskFill2File => "diskfill2file",
            TransferMode::In2Disk => "in2disk",
            TransferMode::In2Net => "in2net",
            TransferMode::Net2Out => "net2out",
        };
        f.write_str(s)
    }
}

/// Where within `connect -> on -> off -> disconnect` the transfer is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Submode {
    pub connected: bool,
    pub running: bool,
}

impl fmt::Display for Submode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.connected, self.running) {
            (false, _) => f.write_str("inactive"),
            (true, false) => f.write_str("connected"),
            (true, true) => f.write_str("active"),
        }
    }
}

/// Byte range selected by `scan_set`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSelection {
    pub scan_name: String,
    pub fp_start: u64,
    pub fp_end: u64,
}

/// Lock-free transfer statistics.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_read: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_lost: AtomicU64,
}

impl Counters {
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_packet(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_lost.store(0, Ordering::Relaxed);
    }
}

/// Everything mutable about the current transfer, under the runtime lock.
pub struct RuntimeState {
    pub netparms: NetParms,
    pub sizes: Option<ConstraintSet>,
    pub solution: Option<Solution>,
    pub frame: Option<FrameDescriptor>,
    pub datastreams: DataStreams,
    pub board: CaptureBoardHandle,
    pub disk: Option<DiskArrayHandle>,
    pub mountpoints: Vec<PathBuf>,
    pub scan: ScanSelection,
    pub mode: TransferMode,
    pub submode: Submode,
    pub chain: Option<Arc<Chain>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        RuntimeState {
            netparms: NetParms::default(),
            sizes: None,
            solution: None,
            frame: None,
            datastreams: DataStreams::new(),
            board: CaptureBoardHandle::none(),
            disk: None,
            mountpoints: Vec::new(),
            scan: ScanSelection::default(),
            mode: TransferMode::NoTransfer,
            submode: Submode::default(),
            chain: None,
        }
    }
}

impl RuntimeState {
    /// Back to idle: mode cleared, chain handle dropped. The chain itself
    /// must already be stopped by the caller.
    pub fn reset_transfer(&mut self) {
        self.mode = TransferMode::NoTransfer;
        self.submode = Submode::default();
        self.chain = None;
    }
}

/// Shared handle to one runtime.
#[derive(Clone)]
pub struct Runtime {
    state: Arc<Mutex<RuntimeState>>,
    pub counters: Arc<Counters>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            state: Arc::new(Mutex::new(RuntimeState::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().expect("runtime lock poisoned")
    }

    pub fn mode(&self) -> TransferMode {
        self.lock().mode
    }

    pub fn submode(&self) -> Submode {
        self.lock().submode
    }

    /// Stops whatever is running and returns the runtime to idle. The
    /// transition to idle happens even when stopping the chain reports a
    /// failure.
    pub fn force_idle(&self) {
        let chain = {
            let mut st = self.lock();
            let chain = st.chain.take();
            st.reset_transfer();
            chain
        };
        if let Some(chain) = chain {
            if let Err(e) = chain.stop() {
                log::error!("stopping chain: {}", e);
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        write!(f, "Runtime[{} {}]", st.mode, st.submode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_runtime_is_idle() {
        let rte = Runtime::new();
        assert_eq!(rte.mode(), TransferMode::NoTransfer);
        assert_eq!(format!("{}", rte.submode()), "inactive");
    }

    #[test]
    fn force_idle_always_lands_idle() {
        let rte = Runtime::new();
        {
            let mut st = rte.lock();
            st.mode = TransferMode::Fill2Net;
            st.submode = Submode {
                connected: true,
                running: true,
            };
        }
        rte.force_idle();
        assert_eq!(rte.mode(), TransferMode::NoTransfer);
        assert!(rte.lock().chain.is_none());
    }

    #[test]
    fn counters_accumulate() {
        let rte = Runtime::new();
        rte.counters.add_read(100);
        rte.counters.add_sent(60);
        rte.counters.add_packet();
        assert_eq!(rte.counters.bytes_read.load(Ordering::Relaxed), 100);
        rte.counters.reset();
        assert_eq!(rte.counters.bytes_sent.load(Ordering::Relaxed), 0);
    }
}
