//! flexrec: core engine for striped VLBI baseband capture, transport and
//! replay.
//!
//! The crate ingests sampled telescope data from a capture board or the
//! network, optionally transforms it (track-mask compression, channel
//! splitting, time-stamp handling), and routes it to scatter-gather
//! storage (flexbuff or Mark6 style striping over many mountpoints, or a
//! streamstor-style disk array) or back out over the network, and the
//! reverse, replaying recordings to the network or the output board.
//!
//! The moving parts:
//!
//! * [`chain`]: the staged multi-threaded pipeline every transfer runs on
//! * [`constraints`]: derives consistent block/read/write sizes from the
//!   MTU, protocol overheads, frame size and compression
//! * [`trackmask`]: plans and executes bit-packing compression for a
//!   64-bit track mask
//! * [`frame`]: Mark4, VLBA, Mark5B and VDIF frame formats with their
//!   time codes
//! * [`vbs`] / [`writer`]: the striped virtual-file layer and its
//!   writing counterpart
//! * [`userdir`]: the binary scan-directory layouts of disk packs
//! * [`transfer`]: `connect -> on -> off -> disconnect` state machines
//!   behind the operator command set

pub mod block;
pub mod chain;
pub mod constraints;
pub mod datastream;
pub mod dot;
pub mod errorqueue;
pub mod frame;
pub mod hrtime;
pub mod hw;
pub mod mount;
pub mod net;
pub mod queue;
pub mod runtime;
pub mod trackmask;
pub mod transfer;
pub mod userdir;
pub mod vbs;
pub mod writer;

pub use crate::block::{Block, BlockMut, BlockPool, TaggedBlock};
pub use crate::chain::{Chain, ChainBuilder, StepHandle, StepId};
pub use crate::constraints::{constrain, Constraint, ConstraintSet};
pub use crate::frame::{FrameDescriptor, FrameFormat};
pub use crate::hrtime::HighResTime;
pub use crate::net::NetParms;
pub use crate::queue::Queue;
pub use crate::runtime::{Runtime, TransferMode};
pub use crate::trackmask::{solve, Solution};
