//! Operator utility around the flexrec core.
//!
//! Not the station control interface; just enough CLI to inspect and
//! replay striped recordings and to dry-run the size solver and the
//! compression planner from a shell.

use flexrec::constraints::{self, Constraint};
use flexrec::frame::{FrameDescriptor, FrameFormat};
use flexrec::{mount, trackmask, vbs};
use num_rational::Ratio;
use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "flexrec", about = "inspect and replay striped VLBI recordings")]
enum Cmd {
    /// Lists recordings found on the given mountpoint patterns
    Ls {
        /// mountpoint patterns (shell glob or ^regex)
        #[structopt(required = true)]
        patterns: Vec<String>,
    },
    /// Streams a recording to stdout in chunk order
    Cat {
        recording: String,
        /// mountpoint directories to search
        #[structopt(short, long, required = true)]
        mount: Vec<PathBuf>,
    },
    /// Runs the block/read/write size solver and prints the result
    Solve {
        #[structopt(long, default_value = "tcp")]
        protocol: String,
        #[structopt(long, default_value = "1500")]
        mtu: u32,
        #[structopt(long, default_value = "131072")]
        blocksize: u32,
        /// pin a fixed frame format, e.g. mark5b
        #[structopt(long)]
        format: Option<FrameFormat>,
    },
    /// Plans track-mask compression and prints the packing program
    Mask {
        /// 64-bit track mask, hex
        mask: String,
    },
}

fn list_recordings(patterns: &[String]) -> Result<(), Box<dyn Error>> {
    let mounts = mount::find_mountpoints(patterns)?;
    if mounts.is_empty() {
        return Err("no mountpoints match".into());
    }
    let mut names: Vec<String> = Vec::new();
    for m in &mounts {
        for entry in std::fs::read_dir(m)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names.sort();
    for name in names {
        let chunks = vbs::find_recording_chunks(&name, &mounts);
        if chunks.is_empty() {
            continue;
        }
        let total: u64 = chunks.iter().map(|c| c.size).sum();
        println!("{:40} {:4} chunks {:>14} bytes", name, chunks.len(), total);
    }
    Ok(())
}

fn cat_recording(recording: &str, mounts: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let handle = vbs::open(recording, mounts)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = vbs::read(handle, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    vbs::close(handle)?;
    Ok(())
}

fn solve_sizes(
    protocol: &str,
    mtu: u32,
    blocksize: u32,
    format: Option<FrameFormat>,
) -> Result<(), Box<dyn Error>> {
    let mut set = constraints::from_network(protocol, mtu, blocksize);
    if let Some(fmt) = format {
        let rate = Ratio::from_integer(32_000_000u64);
        let descriptor = FrameDescriptor::new(fmt, 32, rate, 8000)?;
        set.set(Constraint::FrameSize, descriptor.framesize);
    }
    let solved = constraints::constrain_set(&set, None)?;
    for c in &[
        Constraint::BlockSize,
        Constraint::ReadSize,
        Constraint::WriteSize,
        Constraint::Mtu,
        Constraint::ProtocolOverhead,
        Constraint::ApplicationOverhead,
    ] {
        println!("{:20} = {}", c.to_string(), solved.get(*c).unwrap_or(0));
    }
    Ok(())
}

fn plan_mask(text: &str) -> Result<(), Box<dyn Error>> {
    let mask = u64::from_str_radix(text.trim_start_matches("0x"), 16)?;
    let solution = trackmask::solve(mask)?;
    print!("{}", solution.program_listing());
    println!(
        "compression: {} -> {} words per cycle",
        solution.cycle(),
        solution.compressed_cycle()
    );
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    match Cmd::from_args() {
        Cmd::Ls { patterns } => list_recordings(&patterns),
        Cmd::Cat { recording, mount } => cat_recording(&recording, &mount),
        Cmd::Solve {
            protocol,
            mtu,
            blocksize,
            format,
        } => solve_sizes(&protocol, mtu, blocksize, format),
        Cmd::Mask { mask } => plan_mask(&mask),
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
