//! Transfer-mode state machines and their command entry points.
//!
//! Every transfer mode is the same little machine over one runtime:
//! `connect` builds and starts a chain whose producer parks in a wait
//! state, `on` releases the data flow, `off` pauses or finishes it, and
//! `disconnect` tears the chain down. Commands return VSI-S style replies
//! (`0` ok, `1` pending, `4` failure, `6` wrong state, `8` syntax); an
//! invalid command for the current state never changes that state.
//!
//! The data path is a two- or three-step chain: a reader step pulling
//! blocks from a byte source (disk array, striped recording, plain file,
//! fill pattern, capture-board FIFO or network receiver), an optional
//! compression step, and a writer step pushing `write_size` pieces into a
//! byte sink (network sender, file, disk array or capture board) at the
//! configured inter-packet delay.

use crate::block::{Block, BlockPool};
use crate::chain::{Chain, StepResult};
use crate::constraints::{self, Constraint};
use crate::errorqueue;
use crate::hw::{CaptureBoard, CaptureBoardHandle, DiskArray, DiskArrayHandle};
use crate::net::{is_multicast, HostPort, NetParms};
use crate::runtime::{Runtime, Submode, TransferMode};
use crate::trackmask::{self, Compressor};
use crate::vbs;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

//
// ---- replies ------------------------------------------------------------
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyCode {
    Ok = 0,
    Pending = 1,
    Failure = 4,
    WrongState = 6,
    Syntax = 8,
}

/// A formatted command or query reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub mode: &'static str,
    pub query: bool,
    pub code: ReplyCode,
    pub fields: Vec<String>,
}

impl Reply {
    fn new(mode: &'static str, query: bool, code: ReplyCode) -> Self {
        Reply {
            mode,
            query,
            code,
            fields: Vec::new(),
        }
    }

    fn with(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "!{}{} {}",
            self.mode,
            if self.query { "?" } else { "=" },
            self.code as u8
        )?;
        for field in &self.fields {
            write!(f, " : {}", field)?;
        }
        write!(f, " ;")
    }
}

enum CmdError {
    WrongState(String),
    Syntax(String),
    Failure(String),
}

impl CmdError {
    fn into_reply(self, mode: &'static str, query: bool) -> Reply {
        let (code, text) = match self {
            CmdError::WrongState(t) => (ReplyCode::WrongState, t),
            CmdError::Syntax(t) => (ReplyCode::Syntax, t),
            CmdError::Failure(t) => {
                errorqueue::push_error(4, format!("{}: {}", mode, t));
                (ReplyCode::Failure, t)
            }
        };
        Reply::new(mode, query, code).with(text)
    }
}

type CmdResult<T = ()> = Result<T, CmdError>;

fn failure(e: impl fmt::Display) -> CmdError {
    CmdError::Failure(e.to_string())
}

//
// ---- network senders and receivers --------------------------------------
//

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound data connection for the `*2net` family.
pub enum NetSender {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp {
        sock: UdpSocket,
        seqno: Option<u64>,
        scratch: Vec<u8>,
    },
}

impl NetSender {
    /// Connects per the runtime's protocol. `rtcp` reverses the roles:
    /// this side listens and the peer dials in.
    pub fn connect(np: &NetParms, host: &HostPort) -> io::Result<NetSender> {
        match np.protocol().as_str() {
            "tcp" => {
                let stream = TcpStream::connect((host.host.as_str(), host.port))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(NetSender::Tcp(stream))
            }
            "rtcp" => {
                let listener = TcpListener::bind(("0.0.0.0", host.port))?;
                let (stream, peer) = listener.accept()?;
                log::info!("reverse TCP: accepted {}", peer);
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                Ok(NetSender::Tcp(stream))
            }
            "unix" => Ok(NetSender::Unix(UnixStream::connect(&host.host)?)),
            proto if proto.contains("udp") => {
                let sock = UdpSocket::bind(("0.0.0.0", 0))?;
                sock.connect((host.host.as_str(), host.port))?;
                let seqno = if proto == "udps" || proto == "udpsnor" {
                    Some(0)
                } else {
                    None
                };
                Ok(NetSender::Udp {
                    sock,
                    seqno,
                    scratch: Vec::new(),
                })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("protocol {} cannot send", other),
            )),
        }
    }

    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            NetSender::Tcp(s) => s.write_all(payload),
            NetSender::Unix(s) => s.write_all(payload),
            NetSender::Udp {
                sock,
                seqno,
                scratch,
            } => {
                match seqno {
                    Some(seq) => {
                        scratch.clear();
                        scratch.extend_from_slice(&seq.to_le_bytes());
                        scratch.extend_from_slice(payload);
                        *seq += 1;
                        sock.send(scratch)?;
                    }
                    None => {
                        sock.send(payload)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Inbound data connection for `net2out`.
pub enum NetReceiver {
    Tcp(TcpStream),
    Udp { sock: UdpSocket, seq: bool },
}

impl NetReceiver {
    pub fn bind(np: &NetParms, local: &HostPort) -> io::Result<NetReceiver> {
        match np.protocol().as_str() {
            "tcp" | "rtcp" => {
                let listener = TcpListener::bind(("0.0.0.0", local.port))?;
                let (stream, peer) = listener.accept()?;
                log::info!("net2out: accepted {}", peer);
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                Ok(NetReceiver::Tcp(stream))
            }
            proto if proto.contains("udp") => {
                let sock = UdpSocket::bind(("0.0.0.0", local.port))?;
                if is_multicast(&local.host) {
                    let group = local.host.parse().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "bad multicast group")
                    })?;
                    sock.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?;
                }
                sock.set_read_timeout(Some(IO_TIMEOUT))?;
                Ok(NetReceiver::Udp {
                    sock,
                    seq: proto == "udps" || proto == "udpsnor",
                })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("protocol {} cannot receive", other),
            )),
        }
    }

    /// Receives one piece of payload, sequence number stripped.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetReceiver::Tcp(s) => s.read(buf),
            NetReceiver::Udp { sock, seq } => {
                if *seq {
                    let mut framed = vec![0u8; buf.len() + 8];
                    let n = sock.recv(&mut framed)?;
                    if n < 8 {
                        return Ok(0); // runt datagram, no payload
                    }
                    let payload = n - 8;
                    buf[..payload].copy_from_slice(&framed[8..n]);
                    Ok(payload)
                } else {
                    sock.recv(buf)
                }
            }
        }
    }
}

//
// ---- byte sources and sinks ---------------------------------------------
//

const FILL_PATTERN: u64 = 0x1122_3344_1122_3344;

/// Where a transfer's bytes come from.
pub enum ByteSource {
    File(File),
    Vbs(i32),
    Fill { start: u64, inc: u64 },
    Disk(DiskArrayHandle),
    Board(CaptureBoardHandle),
    Net(Mutex<NetReceiver>),
}

impl ByteSource {
    /// Reads at `pos`; streaming sources (board, network) ignore the
    /// position and hand out the next piece of their stream.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteSource::File(f) => f.read_at(buf, pos),
            ByteSource::Vbs(h) => {
                vbs::seek(*h, io::SeekFrom::Start(pos)).map_err(other_err)?;
                vbs::read(*h, buf).map_err(other_err)
            }
            ByteSource::Fill { start, inc } => {
                let first = pos / 8;
                for (k, word) in buf.chunks_mut(8).enumerate() {
                    let value = start.wrapping_add(inc.wrapping_mul(first + k as u64));
                    let bytes = value.to_le_bytes();
                    word.copy_from_slice(&bytes[..word.len()]);
                }
                Ok(buf.len())
            }
            ByteSource::Disk(d) => d.with(|disk| disk.playback(pos, buf)).map_err(other_err),
            ByteSource::Board(b) => b.with(|board| board.read_fifo(buf)).map_err(other_err),
            ByteSource::Net(rx) => {
                let mut rx = rx.lock().expect("receiver lock");
                rx.recv(buf)
            }
        }
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        if let ByteSource::Vbs(h) = self {
            let _ = vbs::close(*h);
        }
    }
}

/// Where a transfer's bytes go.
pub enum ByteSink {
    Net(NetSender),
    File(File),
    Disk(DiskArrayHandle),
    Board(CaptureBoardHandle),
    Null,
}

impl ByteSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            ByteSink::Net(s) => s.send(data),
            ByteSink::File(f) => f.write_all(data),
            ByteSink::Disk(d) => d.with(|disk| disk.append(data)).map_err(other_err),
            ByteSink::Board(b) => b
                .with(|board| board.write_out(data))
                .map(|_| ())
                .map_err(other_err),
            ByteSink::Null => Ok(()),
        }
    }
}

fn other_err(e: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

//
// ---- the generic transfer engine ----------------------------------------
//

/// Producer control block, shared with `communicate`.
pub struct ProducerCtl {
    pub run: bool,
    pub pos: u64,
    pub start: u64,
    pub end: u64,
    pub repeat: bool,
}

/// Whether `off` pauses the producer or finishes the whole transfer.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OffSemantics {
    TwoStage,
    Immediate,
}

fn off_semantics(mode: TransferMode) -> OffSemantics {
    match mode {
        TransferMode::In2Disk | TransferMode::Net2Out => OffSemantics::Immediate,
        _ => OffSemantics::TwoStage,
    }
}

/// Builds the chain for `mode` and installs it on the runtime; the
/// producer parks until `on`.
fn connect_transfer(
    rte: &Runtime,
    mode: TransferMode,
    source: ByteSource,
    sink: ByteSink,
) -> CmdResult {
    // phase 1: verify state, gather configuration
    let (sizes, nblock, ipd_ns, solution) = {
        let st = rte.lock();
        if st.mode != TransferMode::NoTransfer {
            return Err(CmdError::WrongState(format!("already doing {}", st.mode)));
        }
        let sizes = constraints::constrain(&st.netparms, st.frame.as_ref(), st.solution.as_ref())
            .map_err(failure)?;
        (
            sizes,
            st.netparms.nblock as usize,
            st.netparms.effective_ipd_ns().max(0) as u64,
            st.solution.clone(),
        )
    };
    let blocksize = sizes.get(Constraint::BlockSize).expect("solved set") as usize;
    let read_size = sizes.get(Constraint::ReadSize).expect("solved set") as usize;
    let write_size = sizes.get(Constraint::WriteSize).expect("solved set") as usize;
    let offset = sizes.get(Constraint::CompressOffset).expect("solved set") as usize;
    let compressor = match &solution {
        Some(sol) => Some(
            trackmask::compressor_for(sol.trackmask(), ((read_size - offset) / 8) as u32, 0)
                .map_err(failure)?,
        ),
        None => None,
    };

    // phase 2: build and start the chain, no locks held
    let counters = Arc::clone(&rte.counters);
    let source_cell = Mutex::new(Some(source));
    let mut builder = Chain::builder().source::<ProducerCtl, Block, _, _>(
        "reader",
        1,
        nblock.max(1),
        || ProducerCtl {
            run: false,
            pos: 0,
            start: 0,
            end: 0,
            repeat: false,
        },
        move |h, out| -> StepResult {
            let source = match source_cell.lock().expect("source cell").take() {
                Some(s) => s,
                None => return Ok(()),
            };
            let pool = BlockPool::new(blocksize, nblock.max(1) + 1);
            loop {
                if !h.wait_until(|c| c.run) {
                    break; // cancelled
                }
                let (mut pos, end, repeat) = h.with(|c| (c.pos, c.end, c.repeat));
                let mut want = blocksize;
                if end > 0 {
                    if pos >= end {
                        if repeat {
                            h.with(|c| c.pos = c.start);
                            continue;
                        }
                        break;
                    }
                    want = want.min((end - pos) as usize);
                }
                let mut block = pool.get();
                let n = source.read_at(pos, &mut block.data()[..want])?;
                if n == 0 {
                    if repeat {
                        h.with(|c| c.pos = c.start);
                        continue;
                    }
                    break;
                }
                block.truncate(n);
                counters.add_read(n as u64);
                pos += n as u64;
                h.with(|c| c.pos = pos);
                if out.push(block.freeze()).is_err() {
                    break;
                }
            }
            Ok(())
        },
    );
    let reader_id = builder.last_step_id();
    builder.register_cancel::<ProducerCtl>(reader_id, |c| c.run = false);
    {
        let rte_done = rte.clone();
        builder.register_final(move || {
            log::info!("transfer drained; back to idle");
            let mut st = rte_done.lock();
            st.mode = TransferMode::NoTransfer;
            st.submode = Submode::default();
        });
    }

    let counters = Arc::clone(&rte.counters);
    let sink_cell = Mutex::new(Some(sink));
    let writer_body = move |block: Block, sink: &mut ByteSink| -> io::Result<()> {
        for piece in block.chunks(write_size.max(1)) {
            sink.write(piece)?;
            counters.add_sent(piece.len() as u64);
            counters.add_packet();
            if ipd_ns > 0 {
                thread::sleep(Duration::from_nanos(ipd_ns));
            }
        }
        Ok(())
    };

    let chain = match compressor {
        Some(compressor) => {
            let builder = builder.step::<(), Block, _, _>(
                "compress",
                1,
                nblock.max(1),
                || (),
                move |_h, input, output| -> StepResult {
                    while let Some(block) = input.pop() {
                        for chunk in block.chunks(read_size) {
                            let packed = compress_chunk(&compressor, chunk, offset);
                            if output.push(Block::from_vec(packed)).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Ok(())
                },
            );
            finish_sink(builder, sink_cell, writer_body)
        }
        None => finish_sink(builder, sink_cell, writer_body),
    };

    chain.run().map_err(failure)?;

    // phase 3: install
    let chain = Arc::new(chain);
    let mut st = rte.lock();
    if st.mode != TransferMode::NoTransfer {
        drop(st);
        let _ = chain.stop();
        return Err(CmdError::WrongState("runtime got busy concurrently".into()));
    }
    st.chain = Some(chain);
    st.sizes = Some(sizes);
    st.mode = mode;
    st.submode = Submode {
        connected: true,
        running: false,
    };
    Ok(())
}

fn finish_sink<B>(
    builder: crate::chain::ChainBuilder<Block>,
    sink_cell: Mutex<Option<ByteSink>>,
    body: B,
) -> Chain
where
    B: Fn(Block, &mut ByteSink) -> io::Result<()> + Send + Sync + 'static,
{
    builder.sink::<(), _, _>("writer", 1, || (), move |_h, input| -> StepResult {
        let mut sink = match sink_cell.lock().expect("sink cell").take() {
            Some(s) => s,
            None => return Ok(()),
        };
        while let Some(block) = input.pop() {
            body(block, &mut sink)?;
        }
        Ok(())
    })
}

/// Compresses one `read_size` chunk: `offset` bytes pass through verbatim,
/// the rest is packed word-wise.
fn compress_chunk(compressor: &Compressor, chunk: &[u8], offset: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len());
    out.extend_from_slice(&chunk[..offset.min(chunk.len())]);
    let body = &chunk[offset.min(chunk.len())..];
    let nwords = body.len() / 8;
    let mut words = Vec::with_capacity(nwords);
    for w in body.chunks_exact(8) {
        words.push(LittleEndian::read_u64(w));
    }
    let mut packed = Vec::with_capacity(nwords);
    if compressor.compress(&words, &mut packed).is_err() {
        // short trailing chunk: pass through unpacked
        out.extend_from_slice(body);
        return out;
    }
    for w in packed {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, w);
        out.extend_from_slice(&bytes);
    }
    out
}

fn turn_on(rte: &Runtime, mode: TransferMode, args: &[&str]) -> CmdResult {
    let st = rte.lock();
    if st.mode != mode {
        return Err(CmdError::WrongState(format!("not doing {}", mode)));
    }
    if !st.submode.connected || st.submode.running {
        return Err(CmdError::WrongState(format!("{}", st.submode)));
    }
    let parse = |s: &str| -> CmdResult<u64> {
        s.parse()
            .map_err(|_| CmdError::Syntax(format!("bad number `{}'", s)))
    };
    let mut start = st.scan.fp_start;
    let mut end = st.scan.fp_end;
    let mut repeat = false;
    if let Some(s) = args.first().filter(|s| !s.is_empty()) {
        start = parse(s)?;
    }
    if let Some(s) = args.get(1).filter(|s| !s.is_empty()) {
        // "+N" means N bytes from the start pointer
        end = match s.strip_prefix('+') {
            Some(n) => start + parse(n)?,
            None => parse(s)?,
        };
    }
    if let Some(s) = args.get(2).filter(|s| !s.is_empty()) {
        repeat = *s == "1" || *s == "true";
    }
    if end > 0 && end < start {
        return Err(CmdError::Syntax(format!("end {} before start {}", end, start)));
    }
    let chain = st.chain.as_ref().cloned().ok_or_else(|| {
        CmdError::Failure("connected but no chain present".into())
    })?;
    drop(st);
    chain
        .communicate::<ProducerCtl, _>(crate::chain::StepId::FIRST, move |c| {
            c.start = start;
            c.pos = start;
            c.end = end;
            c.repeat = repeat;
            c.run = true;
        })
        .map_err(failure)?;
    let mut st = rte.lock();
    st.submode.running = true;
    Ok(())
}

fn turn_off(rte: &Runtime, mode: TransferMode) -> CmdResult {
    let st = rte.lock();
    if st.mode != mode {
        return Err(CmdError::WrongState(format!("not doing {}", mode)));
    }
    if !st.submode.running {
        return Err(CmdError::WrongState("not running".into()));
    }
    let chain = st.chain.as_ref().cloned();
    drop(st);
    match off_semantics(mode) {
        OffSemantics::TwoStage => {
            if let Some(chain) = chain {
                chain
                    .communicate::<ProducerCtl, _>(crate::chain::StepId::FIRST, |c| {
                        c.run = false
                    })
                    .map_err(failure)?;
            }
            let mut st = rte.lock();
            st.submode.running = false;
        }
        OffSemantics::Immediate => {
            // stop feeding and let the pipeline drain; the finalizer
            // clears the mode once the last block went out
            if let Some(chain) = chain {
                chain
                    .communicate::<ProducerCtl, _>(crate::chain::StepId::FIRST, |c| {
                        c.run = false
                    })
                    .map_err(failure)?;
                chain.delayed_disable();
            }
            let mut st = rte.lock();
            st.submode.running = false;
        }
    }
    Ok(())
}

fn do_disconnect(rte: &Runtime, mode: TransferMode) -> CmdResult {
    {
        let st = rte.lock();
        if st.mode != mode {
            return Err(CmdError::WrongState(format!("not doing {}", mode)));
        }
    }
    rte.force_idle();
    Ok(())
}

fn status_reply(rte: &Runtime, mode: TransferMode, name: &'static str) -> Reply {
    let st = rte.lock();
    if st.mode == mode {
        Reply::new(name, true, ReplyCode::Ok)
            .with(format!("{}", st.submode))
            .with(format!(
                "{}",
                rte.counters
                    .bytes_sent
                    .load(std::sync::atomic::Ordering::Relaxed)
            ))
    } else if st.mode == TransferMode::NoTransfer {
        Reply::new(name, true, ReplyCode::Ok).with("inactive")
    } else {
        Reply::new(name, true, ReplyCode::WrongState).with(format!("doing {}", st.mode))
    }
}

/// Runs the shared `connect/on/off/disconnect` machine for one mode;
/// `make_endpoints` builds the source/sink pair from the connect args.
fn run_command<F>(
    name: &'static str,
    mode: TransferMode,
    query: bool,
    args: &[&str],
    rte: &Runtime,
    make_endpoints: F,
) -> Reply
where
    F: FnOnce(&[&str], &Runtime) -> CmdResult<(ByteSource, ByteSink)>,
{
    if query {
        return status_reply(rte, mode, name);
    }
    let verb = match args.first() {
        Some(v) => *v,
        None => return Reply::new(name, false, ReplyCode::Syntax).with("missing verb"),
    };
    let rest = &args[1..];
    let outcome = match verb {
        // check the state before building endpoints, so a wrong-state
        // connect has no side effects (no sockets dialled, no files made)
        "connect" | "open" => match rte.mode() {
            TransferMode::NoTransfer => make_endpoints(rest, rte)
                .and_then(|(source, sink)| connect_transfer(rte, mode, source, sink)),
            busy => Err(CmdError::WrongState(format!("already doing {}", busy))),
        },
        "on" => turn_on(rte, mode, rest),
        "off" => turn_off(rte, mode),
        "disconnect" | "close" => do_disconnect(rte, mode),
        other => Err(CmdError::Syntax(format!("unknown verb `{}'", other))),
    };
    match outcome {
        Ok(()) => Reply::new(name, false, ReplyCode::Ok),
        Err(e) => e.into_reply(name, false),
    }
}

//
// ---- endpoint construction per mode -------------------------------------
//

fn parse_host(args: &[&str], default_port: u16) -> CmdResult<HostPort> {
    let host = args
        .first()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CmdError::Syntax("missing host".into()))?;
    if host.contains(':') {
        host.parse()
            .map_err(|e| CmdError::Syntax(format!("{}", e)))
    } else {
        let port = match args.get(1).filter(|p| !p.is_empty()) {
            Some(p) => p
                .parse()
                .map_err(|_| CmdError::Syntax(format!("bad port `{}'", p)))?,
            None => default_port,
        };
        Ok(HostPort {
            host: (*host).to_owned(),
            port,
            suffix: None,
        })
    }
}

const DATA_PORT: u16 = 2630;

fn net_sink(rte: &Runtime, host: &HostPort) -> CmdResult<ByteSink> {
    let np = rte.lock().netparms.clone();
    NetSender::connect(&np, host)
        .map(ByteSink::Net)
        .map_err(failure)
}

fn disk_source(rte: &Runtime) -> CmdResult<ByteSource> {
    rte.lock()
        .disk
        .clone()
        .map(ByteSource::Disk)
        .ok_or_else(|| CmdError::Failure("no disk array attached".into()))
}

fn vbs_source(rte: &Runtime) -> CmdResult<ByteSource> {
    let (scan, mounts) = {
        let st = rte.lock();
        (st.scan.clone(), st.mountpoints.clone())
    };
    if scan.scan_name.is_empty() {
        return Err(CmdError::Failure("no scan selected (scan_set first)".into()));
    }
    let handle = vbs::open(&scan.scan_name, &mounts).map_err(failure)?;
    Ok(ByteSource::Vbs(handle))
}

//
// ---- the public command surface -----------------------------------------
//

pub fn disk2net(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "disk2net",
        TransferMode::Disk2Net,
        query,
        args,
        rte,
        |rest, rte| {
            let host = parse_host(rest, DATA_PORT)?;
            Ok((disk_source(rte)?, net_sink(rte, &host)?))
        },
    )
}

pub fn disk2net_vbs(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "disk2net_vbs",
        TransferMode::Disk2NetVbs,
        query,
        args,
        rte,
        |rest, rte| {
            let host = parse_host(rest, DATA_PORT)?;
            Ok((vbs_source(rte)?, net_sink(rte, &host)?))
        },
    )
}

pub fn file2net(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "file2net",
        TransferMode::File2Net,
        query,
        args,
        rte,
        |rest, rte| {
            let host = parse_host(rest, DATA_PORT)?;
            let path = rest
                .get(1)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| CmdError::Syntax("missing file name".into()))?;
            let file = File::open(path).map_err(failure)?;
            Ok((ByteSource::File(file), net_sink(rte, &host)?))
        },
    )
}

pub fn fill2net(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "fill2net",
        TransferMode::Fill2Net,
        query,
        args,
        rte,
        |rest, rte| {
            let host = parse_host(rest, DATA_PORT)?;
            let parse_word = |s: &str| -> CmdResult<u64> {
                let t = s.trim_start_matches("0x");
                u64::from_str_radix(t, 16)
                    .or_else(|_| s.parse())
                    .map_err(|_| CmdError::Syntax(format!("bad fill word `{}'", s)))
            };
            let start = match rest.get(1).filter(|s| !s.is_empty()) {
                Some(s) => parse_word(s)?,
                None => FILL_PATTERN,
            };
            let inc = match rest.get(2).filter(|s| !s.is_empty()) {
                Some(s) => parse_word(s)?,
                None => 0,
            };
            Ok((ByteSource::Fill { start, inc }, net_sink(rte, &host)?))
        },
    )
}

pub fn disk2out(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "disk2out",
        TransferMode::Disk2Out,
        query,
        args,
        rte,
        |_rest, rte| {
            let board = rte.lock().board.clone();
            Ok((disk_source(rte)?, ByteSink::Board(board)))
        },
    )
}

pub fn diskfill2file(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "diskfill2file",
        TransferMode::DiskFill2File,
        query,
        args,
        rte,
        |rest, _rte| {
            let path = rest
                .first()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| CmdError::Syntax("missing file name".into()))?;
            let file = File::create(path).map_err(failure)?;
            Ok((
                ByteSource::Fill {
                    start: FILL_PATTERN,
                    inc: 1,
                },
                ByteSink::File(file),
            ))
        },
    )
}

pub fn in2disk(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "in2disk",
        TransferMode::In2Disk,
        query,
        args,
        rte,
        |_rest, rte| {
            let (board, disk) = {
                let st = rte.lock();
                (st.board.clone(), st.disk.clone())
            };
            let disk = disk.ok_or_else(|| CmdError::Failure("no disk array attached".into()))?;
            board.with(|b| b.setup().and_then(|_| b.start())).map_err(failure)?;
            Ok((ByteSource::Board(board), ByteSink::Disk(disk)))
        },
    )
}

pub fn in2net(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "in2net",
        TransferMode::In2Net,
        query,
        args,
        rte,
        |rest, rte| {
            let host = parse_host(rest, DATA_PORT)?;
            let board = rte.lock().board.clone();
            board.with(|b| b.setup().and_then(|_| b.start())).map_err(failure)?;
            Ok((ByteSource::Board(board), net_sink(rte, &host)?))
        },
    )
}

pub fn net2out(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    run_command(
        "net2out",
        TransferMode::Net2Out,
        query,
        args,
        rte,
        |rest, rte| {
            let local = parse_host(rest, DATA_PORT).unwrap_or(HostPort {
                host: "0.0.0.0".to_owned(),
                port: DATA_PORT,
                suffix: None,
            });
            let (np, board) = {
                let st = rte.lock();
                (st.netparms.clone(), st.board.clone())
            };
            let rx = NetReceiver::bind(&np, &local).map_err(failure)?;
            Ok((ByteSource::Net(Mutex::new(rx)), ByteSink::Board(board)))
        },
    )
}

/// `scan_set`: select a recording (and byte range) for the disk transfers.
pub fn scan_set(query: bool, args: &[&str], rte: &Runtime) -> Reply {
    const NAME: &str = "scan_set";
    if query {
        let st = rte.lock();
        return Reply::new(NAME, true, ReplyCode::Ok)
            .with(st.scan.scan_name.clone())
            .with(st.scan.fp_start.to_string())
            .with(st.scan.fp_end.to_string());
    }
    let name = match args.first().filter(|s| !s.is_empty()) {
        Some(n) => *n,
        None => return Reply::new(NAME, false, ReplyCode::Syntax).with("missing scan name"),
    };
    let mounts = rte.lock().mountpoints.clone();
    let chunks = vbs::find_recording_chunks(name, &mounts);
    if chunks.is_empty() {
        return Reply::new(NAME, false, ReplyCode::Failure)
            .with(format!("no such recording `{}'", name));
    }
    let total: u64 = chunks.iter().map(|c| c.size).sum();
    let parse = |s: &str| s.parse::<u64>();
    let start = match args.get(1).filter(|s| !s.is_empty()) {
        Some(s) => match parse(s) {
            Ok(v) => v,
            Err(_) => return Reply::new(NAME, false, ReplyCode::Syntax).with("bad start"),
        },
        None => 0,
    };
    let end = match args.get(2).filter(|s| !s.is_empty()) {
        Some(s) => {
            let parsed = match s.strip_prefix('+') {
                Some(n) => parse(n).map(|v| start + v),
                None => parse(s),
            };
            match parsed {
                Ok(v) => v.min(total),
                Err(_) => return Reply::new(NAME, false, ReplyCode::Syntax).with("bad end"),
            }
        }
        None => total,
    };
    if start > end {
        return Reply::new(NAME, false, ReplyCode::Syntax).with("start past end");
    }
    let mut st = rte.lock();
    st.scan.scan_name = name.to_owned();
    st.scan.fp_start = start;
    st.scan.fp_end = end;
    Reply::new(NAME, false, ReplyCode::Ok)
}

/// Name-based dispatch for the text-protocol layer.
pub fn command(name: &str, query: bool, args: &[&str], rte: &Runtime) -> Option<Reply> {
    let f = match name {
        "disk2net" => disk2net,
        "disk2net_vbs" => disk2net_vbs,
        "file2net" => file2net,
        "fill2net" => fill2net,
        "disk2out" => disk2out,
        "diskfill2file" => diskfill2file,
        "in2disk" => in2disk,
        "in2net" => in2net,
        "net2out" => net2out,
        "scan_set" => scan_set,
        _ => return None,
    };
    Some(f(query, args, rte))
}
