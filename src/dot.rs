//! The DOT (Data Observing Time) clock service.
//!
//! On real hardware DOT is an on-card counter driven by an external 1-PPS;
//! here it is a process-wide service owning a pair of time stamps (a
//! monotonic anchor and the DOT value at that anchor). Readers take a
//! snapshot under a lock; the service thread re-anchors the pair once a
//! second the way the card re-syncs on each PPS tick. `init`/`shutdown`
//! form an explicit pair, and shutdown is an atomic cancel-and-join under
//! the service lock, so concurrent shutdowns cannot race each other.

use crate::hrtime::HighResTime;
use lazy_static::lazy_static;
use num_rational::Ratio;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("DOT clock not initialized")]
    NotRunning,
    #[error("DOT clock already initialized")]
    AlreadyRunning,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy)]
struct Anchor {
    at: Instant,
    dot: HighResTime,
}

struct Service {
    snapshot: Arc<RwLock<Anchor>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    join: thread::JoinHandle<()>,
}

lazy_static! {
    static ref SERVICE: Mutex<Option<Service>> = Mutex::new(None);
}

fn nanos_between(later: Instant, earlier: Instant) -> Ratio<u64> {
    let d = later.duration_since(earlier);
    Ratio::from_integer(u64::from(d.subsec_nanos())) / Ratio::from_integer(1_000_000_000u64)
        + Ratio::from_integer(d.as_secs())
}

/// Starts the DOT service with DOT equal to system time.
pub fn init() -> Result<()> {
    init_at(HighResTime::now())
}

/// Starts the DOT service with an explicit initial DOT value.
pub fn init_at(dot: HighResTime) -> Result<()> {
    let mut svc = SERVICE.lock().expect("DOT service lock");
    if svc.is_some() {
        return Err(Error::AlreadyRunning);
    }
    let snapshot = Arc::new(RwLock::new(Anchor {
        at: Instant::now(),
        dot,
    }));
    let stop = Arc::new((Mutex::new(false), Condvar::new()));
    let join = {
        let snapshot = Arc::clone(&snapshot);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("dot-clock".into())
            .spawn(move || {
                let (flag, cond) = &*stop;
                let mut stopped = flag.lock().expect("DOT stop lock");
                while !*stopped {
                    // re-anchor once a second, like the card does on PPS
                    let (guard, _) = cond
                        .wait_timeout(stopped, Duration::from_secs(1))
                        .expect("DOT stop lock");
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    let mut snap = snapshot.write().expect("DOT snapshot lock");
                    let now = Instant::now();
                    let elapsed = nanos_between(now, snap.at);
                    snap.dot = snap.dot.add_frac(elapsed);
                    snap.at = now;
                }
            })
            .expect("spawn DOT clock thread")
    };
    *svc = Some(Service {
        snapshot,
        stop,
        join,
    });
    Ok(())
}

/// Current DOT.
pub fn now() -> Result<HighResTime> {
    let svc = SERVICE.lock().expect("DOT service lock");
    let service = svc.as_ref().ok_or(Error::NotRunning)?;
    let snap = service.snapshot.read().expect("DOT snapshot lock");
    Ok(snap.dot.add_frac(nanos_between(Instant::now(), snap.at)))
}

/// Steps the DOT to `dot` (operator `dot_set`), effective immediately.
pub fn set(dot: HighResTime) -> Result<()> {
    let svc = SERVICE.lock().expect("DOT service lock");
    let service = svc.as_ref().ok_or(Error::NotRunning)?;
    let mut snap = service.snapshot.write().expect("DOT snapshot lock");
    *snap = Anchor {
        at: Instant::now(),
        dot,
    };
    Ok(())
}

/// Stops the service and joins its thread. Safe to call when not running;
/// concurrent callers serialize on the service lock.
pub fn shutdown() {
    let service = {
        let mut svc = SERVICE.lock().expect("DOT service lock");
        svc.take()
    };
    if let Some(service) = service {
        {
            let (flag, cond) = &*service.stop;
            *flag.lock().expect("DOT stop lock") = true;
            cond.notify_all();
        }
        if service.join.join().is_err() {
            log::error!("DOT clock thread panicked");
        }
    }
}
