//! The processing chain: a staged, multi-threaded pipeline.
//!
//! A chain is built step by step, source first. Every step owns a user-data
//! object (created at `run()`, sink to source), a lock and condition
//! variable, and `N` worker threads sharing the step's input and output
//! queues. The concrete user-data and element types are bound once, at
//! registration, and erased behind the step's runner closure; other threads
//! reach a step's user data only through [`Chain::communicate`], which runs
//! the caller's function under the step lock and then wakes the step's
//! workers.
//!
//! Cancellation is queue-closure based: `stop()` runs the registered cancel
//! hooks, flags every step, and disables the queues, which releases any
//! worker blocked on `push` or `pop`. Workers therefore must not block on
//! anything that ignores queue closure. A worker that returns an error
//! records it on the process error queue and exits; the rest of the chain
//! drains naturally.

use crate::errorqueue;
use crate::queue::Queue;
use std::any::Any;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("chain is {0}, operation needs {1}")]
    WrongState(&'static str, &'static str),
    #[error("no such step: {0:?}")]
    NoSuchStep(StepId),
    #[error("step {0:?} has no user data (chain not running?)")]
    NoUserData(StepId),
    #[error("user data of step {0:?} has a different type")]
    UserDataType(StepId),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors a step body may return; they land on the process error queue.
pub type StepResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepId(usize);

impl StepId {
    /// The source step of any chain.
    pub const FIRST: StepId = StepId(0);

    pub fn new(index: usize) -> Self {
        StepId(index)
    }
}

type UserData = Option<Box<dyn Any + Send>>;

/// Per-step state shared between its workers, `communicate` callers and the
/// chain.
struct StepShared {
    name: String,
    id: usize,
    /// queue capacity accumulated from this step down to the sink; set by
    /// `run()`
    cumulative_depth: AtomicUsize,
    lock: Mutex<UserData>,
    cond: Condvar,
    cancelled: AtomicBool,
    live: Mutex<usize>,
}

impl StepShared {
    fn new(name: String, id: usize) -> Arc<Self> {
        Arc::new(StepShared {
            name,
            id,
            cumulative_depth: AtomicUsize::new(0),
            lock: Mutex::new(None),
            cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
            live: Mutex::new(0),
        })
    }
}

/// A worker's typed view of its step.
pub struct StepHandle<U> {
    shared: Arc<StepShared>,
    _marker: PhantomData<fn() -> U>,
}

impl<U: Send + 'static> StepHandle<U> {
    fn new(shared: Arc<StepShared>) -> Self {
        StepHandle {
            shared,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> StepId {
        StepId(self.shared.id)
    }

    /// Queue capacity between this step and the sink.
    pub fn cumulative_depth(&self) -> usize {
        self.shared.cumulative_depth.load(Ordering::SeqCst)
    }

    /// Runs `f` on the step's user data under the step lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut U) -> R) -> R {
        let mut cell = self.shared.lock.lock().expect("step lock poisoned");
        let ud = cell
            .as_mut()
            .and_then(|b| b.downcast_mut::<U>())
            .expect("step user data missing or mistyped");
        f(ud)
    }

    /// Blocks until `pred` holds or the chain is cancelled; returns whether
    /// the predicate was satisfied. The step lock is held while `pred`
    /// runs and released while waiting.
    pub fn wait_until(&self, mut pred: impl FnMut(&mut U) -> bool) -> bool {
        let mut cell = self.shared.lock.lock().expect("step lock poisoned");
        loop {
            if self.cancelled() {
                return false;
            }
            let ud = cell
                .as_mut()
                .and_then(|b| b.downcast_mut::<U>())
                .expect("step user data missing or mistyped");
            if pred(ud) {
                return true;
            }
            cell = self.shared.cond.wait(cell).expect("step lock poisoned");
        }
    }

    /// True once `stop()` has been requested.
    pub fn cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Wakes siblings blocked in [`StepHandle::wait_until`].
    pub fn notify(&self) {
        self.shared.cond.notify_all();
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;
type Runner = Arc<dyn Fn() -> StepResult + Send + Sync>;
type Hook = Box<dyn Fn(&mut (dyn Any + Send)) + Send + Sync>;
type Finalizer = Box<dyn FnOnce() + Send>;
type QueueThunk = Arc<dyn Fn() + Send + Sync>;

struct StepDef {
    shared: Arc<StepShared>,
    nthreads: usize,
    factory: Factory,
    runner: Runner,
}

struct QueueDef {
    capacity: usize,
    delayed_disable: QueueThunk,
    disable: QueueThunk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed,
    Running,
    Drained,
    Joining,
    Finished,
}

struct ChainShared {
    state: Mutex<State>,
    cond: Condvar,
    /// chain-wide live worker count
    live: Mutex<usize>,
    finalizers: Mutex<Vec<Finalizer>>,
}

impl ChainShared {
    /// Last worker overall runs the finalizers exactly once.
    fn worker_exited(&self) {
        let last = {
            let mut live = self.live.lock().expect("chain lock poisoned");
            *live -= 1;
            *live == 0
        };
        if last {
            let finals: Vec<_> = {
                let mut f = self.finalizers.lock().expect("chain lock poisoned");
                f.drain(..).collect()
            };
            for f in finals {
                f();
            }
            let mut state = self.state.lock().expect("chain lock poisoned");
            if *state == State::Running {
                *state = State::Drained;
            }
            self.cond.notify_all();
        }
    }
}

/// Builds a chain; the type parameter tracks the element type flowing out
/// of the most recently added step.
pub struct ChainBuilder<T> {
    steps: Vec<StepDef>,
    queues: Vec<QueueDef>,
    cancellations: Vec<(usize, Hook)>,
    cleanups: Vec<(usize, Hook)>,
    shared: Arc<ChainShared>,
    tail_queue: Option<Box<dyn Any + Send>>,
    _marker: PhantomData<fn() -> T>,
}

/// Marker for a builder with no steps yet.
pub enum Nothing {}

impl ChainBuilder<Nothing> {
    fn new() -> Self {
        ChainBuilder {
            steps: Vec::new(),
            queues: Vec::new(),
            cancellations: Vec::new(),
            cleanups: Vec::new(),
            shared: Arc::new(ChainShared {
                state: Mutex::new(State::Closed),
                cond: Condvar::new(),
                live: Mutex::new(0),
                finalizers: Mutex::new(Vec::new()),
            }),
            tail_queue: None,
            _marker: PhantomData,
        }
    }

    /// First step: produces elements of type `T` into a queue of depth
    /// `qdepth`.
    pub fn source<U, T, F, B>(
        mut self,
        name: &str,
        nthreads: usize,
        qdepth: usize,
        factory: F,
        body: B,
    ) -> ChainBuilder<T>
    where
        U: Send + 'static,
        T: Send + 'static,
        F: Fn() -> U + Send + Sync + 'static,
        B: Fn(StepHandle<U>, Queue<T>) -> StepResult + Send + Sync + 'static,
    {
        let shared = StepShared::new(name.to_owned(), 0);
        let queue: Queue<T> = Queue::new(qdepth);
        self.queues.push(QueueDef {
            capacity: qdepth,
            delayed_disable: {
                let q = queue.clone();
                Arc::new(move || q.delayed_disable())
            },
            disable: {
                let q = queue.clone();
                Arc::new(move || q.disable())
            },
        });
        let runner: Runner = {
            let shared = Arc::clone(&shared);
            let queue = queue.clone();
            let body = Arc::new(body);
            Arc::new(move || body(StepHandle::new(Arc::clone(&shared)), queue.clone()))
        };
        self.steps.push(StepDef {
            shared,
            nthreads: nthreads.max(1),
            factory: Box::new(move || Box::new(factory())),
            runner,
        });
        ChainBuilder {
            steps: self.steps,
            queues: self.queues,
            cancellations: self.cancellations,
            cleanups: self.cleanups,
            shared: self.shared,
            tail_queue: Some(Box::new(queue)),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> ChainBuilder<T> {
    fn take_tail(&mut self) -> Queue<T> {
        *self
            .tail_queue
            .take()
            .expect("builder tail queue missing")
            .downcast::<Queue<T>>()
            .expect("builder type state out of sync")
    }

    /// Intermediate step: consumes `T`, produces `O` into a new queue.
    pub fn step<U, O, F, B>(
        mut self,
        name: &str,
        nthreads: usize,
        qdepth: usize,
        factory: F,
        body: B,
    ) -> ChainBuilder<O>
    where
        U: Send + 'static,
        O: Send + 'static,
        F: Fn() -> U + Send + Sync + 'static,
        B: Fn(StepHandle<U>, Queue<T>, Queue<O>) -> StepResult + Send + Sync + 'static,
    {
        let input = self.take_tail();
        let output: Queue<O> = Queue::new(qdepth);
        self.queues.push(QueueDef {
            capacity: qdepth,
            delayed_disable: {
                let q = output.clone();
                Arc::new(move || q.delayed_disable())
            },
            disable: {
                let q = output.clone();
                Arc::new(move || q.disable())
            },
        });
        let shared = StepShared::new(name.to_owned(), self.steps.len());
        let runner: Runner = {
            let shared = Arc::clone(&shared);
            let input = input.clone();
            let output = output.clone();
            let body = Arc::new(body);
            Arc::new(move || {
                body(
                    StepHandle::new(Arc::clone(&shared)),
                    input.clone(),
                    output.clone(),
                )
            })
        };
        self.steps.push(StepDef {
            shared,
            nthreads: nthreads.max(1),
            factory: Box::new(move || Box::new(factory())),
            runner,
        });
        ChainBuilder {
            steps: self.steps,
            queues: self.queues,
            cancellations: self.cancellations,
            cleanups: self.cleanups,
            shared: self.shared,
            tail_queue: Some(Box::new(output)),
            _marker: PhantomData,
        }
    }

    /// Final step: consumes `T`. Closes the topology and yields the chain.
    pub fn sink<U, F, B>(mut self, name: &str, nthreads: usize, factory: F, body: B) -> Chain
    where
        U: Send + 'static,
        F: Fn() -> U + Send + Sync + 'static,
        B: Fn(StepHandle<U>, Queue<T>) -> StepResult + Send + Sync + 'static,
    {
        let input = self.take_tail();
        let shared = StepShared::new(name.to_owned(), self.steps.len());
        let runner: Runner = {
            let shared = Arc::clone(&shared);
            let input = input.clone();
            let body = Arc::new(body);
            Arc::new(move || body(StepHandle::new(Arc::clone(&shared)), input.clone()))
        };
        self.steps.push(StepDef {
            shared,
            nthreads: nthreads.max(1),
            factory: Box::new(move || Box::new(factory())),
            runner,
        });
        Chain {
            steps: self.steps,
            queues: self.queues,
            cancellations: Mutex::new(self.cancellations),
            cleanups: Mutex::new(self.cleanups),
            shared: self.shared,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Id the next added step will get; lets callers register hooks for
    /// steps as they add them.
    pub fn next_step_id(&self) -> StepId {
        StepId(self.steps.len())
    }

    pub fn last_step_id(&self) -> StepId {
        StepId(self.steps.len().saturating_sub(1))
    }

    /// Registers a cancel hook: run under the step lock when `stop()`
    /// begins, before the queues close. Use it to interrupt blocking work.
    pub fn register_cancel<U: Send + 'static>(
        &mut self,
        step: StepId,
        hook: impl Fn(&mut U) + Send + Sync + 'static,
    ) {
        self.cancellations.push((step.0, erase_hook(hook)));
    }

    /// Registers a cleanup hook: run under the step lock after all workers
    /// joined, before user data is destroyed.
    pub fn register_cleanup<U: Send + 'static>(
        &mut self,
        step: StepId,
        hook: impl Fn(&mut U) + Send + Sync + 'static,
    ) {
        self.cleanups.push((step.0, erase_hook(hook)));
    }

    /// Registers a finalizer: run exactly once by the last worker to exit.
    pub fn register_final(&mut self, f: impl FnOnce() + Send + 'static) {
        self.shared
            .finalizers
            .lock()
            .expect("chain lock poisoned")
            .push(Box::new(f));
    }
}

fn erase_hook<U: Send + 'static>(hook: impl Fn(&mut U) + Send + Sync + 'static) -> Hook {
    Box::new(move |any| {
        if let Some(ud) = any.downcast_mut::<U>() {
            hook(ud)
        } else {
            log::error!("cancel/cleanup hook type mismatch, skipping");
        }
    })
}

/// A closed chain, ready to run once.
pub struct Chain {
    steps: Vec<StepDef>,
    queues: Vec<QueueDef>,
    cancellations: Mutex<Vec<(usize, Hook)>>,
    cleanups: Mutex<Vec<(usize, Hook)>>,
    shared: Arc<ChainShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Chain {
    pub fn builder() -> ChainBuilder<Nothing> {
        ChainBuilder::new()
    }

    pub fn n_steps(&self) -> usize {
        self.steps.len()
    }

    /// Live workers over the whole chain.
    pub fn live_workers(&self) -> usize {
        *self.shared.live.lock().expect("chain lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.shared.state.lock().expect("chain lock poisoned"),
            State::Running
        )
    }

    /// Starts the chain: user data is created and workers spawned from the
    /// sink back to the source, so every consumer is ready before its
    /// producer starts.
    pub fn run(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("chain lock poisoned");
            if *state != State::Closed {
                return Err(Error::WrongState(state_name(*state), "closed"));
            }
            *state = State::Running;
        }
        let total: usize = self.steps.iter().map(|s| s.nthreads).sum();
        *self.shared.live.lock().expect("chain lock poisoned") = total;

        let mut spawned = Vec::new();
        let mut depth_below = 0usize;
        for (idx, step) in self.steps.iter().enumerate().rev() {
            {
                let mut cell = step.shared.lock.lock().expect("step lock poisoned");
                *cell = Some((step.factory)());
            }
            if idx < self.queues.len() {
                depth_below += self.queues[idx].capacity;
            }
            step.shared
                .cumulative_depth
                .store(depth_below, Ordering::SeqCst);
            *step.shared.live.lock().expect("step lock poisoned") = step.nthreads;
            for n in 0..step.nthreads {
                let runner = Arc::clone(&step.runner);
                let step_shared = Arc::clone(&step.shared);
                let chain_shared = Arc::clone(&self.shared);
                let downstream = self
                    .queues
                    .get(idx)
                    .map(|q| (q.delayed_disable.clone(), q.disable.clone()));
                let upstream = idx
                    .checked_sub(1)
                    .and_then(|i| self.queues.get(i))
                    .map(|q| (q.delayed_disable.clone(), q.disable.clone()));
                let res = thread::Builder::new()
                    .name(format!("{}-{}", step_shared.name, n))
                    .spawn(move || {
                        run_worker(runner, step_shared, chain_shared, downstream, upstream)
                    });
                match res {
                    Ok(handle) => spawned.push(handle),
                    Err(e) => {
                        // broken run: correct the live count for everything
                        // that will never start, then tear down
                        log::error!("spawn failed for step {}: {}", step.shared.name, e);
                        let not_started: usize = self.steps[..idx]
                            .iter()
                            .map(|s| s.nthreads)
                            .sum::<usize>()
                            + (step.nthreads - n);
                        {
                            let mut live =
                                self.shared.live.lock().expect("chain lock poisoned");
                            *live -= not_started;
                        }
                        {
                            let mut slive =
                                step.shared.live.lock().expect("step lock poisoned");
                            *slive -= step.nthreads - n;
                        }
                        self.workers
                            .lock()
                            .expect("chain lock poisoned")
                            .extend(spawned);
                        let _ = self.stop_inner(false);
                        return Err(Error::Spawn(e));
                    }
                }
            }
        }
        self.workers
            .lock()
            .expect("chain lock poisoned")
            .extend(spawned);
        Ok(())
    }

    /// Runs `f` on the step's user data under the step lock, then wakes the
    /// step's workers. The only sanctioned way to poke a running step.
    pub fn communicate<U: Send + 'static, R>(
        &self,
        step: StepId,
        f: impl FnOnce(&mut U) -> R,
    ) -> Result<R> {
        let def = self.steps.get(step.0).ok_or(Error::NoSuchStep(step))?;
        let mut cell = def.shared.lock.lock().expect("step lock poisoned");
        let ud = cell
            .as_mut()
            .ok_or(Error::NoUserData(step))?
            .downcast_mut::<U>()
            .ok_or(Error::UserDataType(step))?;
        let result = f(ud);
        drop(cell);
        def.shared.cond.notify_all();
        Ok(result)
    }

    /// Gentle stop: close only the head queue and let the pipeline drain.
    pub fn delayed_disable(&self) {
        if let Some(q) = self.queues.first() {
            (q.delayed_disable)();
        }
    }

    pub fn gentle_stop(&self) -> Result<()> {
        self.stop_inner(true)
    }

    /// Cancels and joins the chain. Idempotent; safe on a never-run chain.
    pub fn stop(&self) -> Result<()> {
        self.stop_inner(false)
    }

    fn stop_inner(&self, gentle: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("chain lock poisoned");
            loop {
                match *state {
                    State::Running | State::Drained => {
                        *state = State::Joining;
                        break;
                    }
                    // another stop is tearing down; wait for it to finish
                    State::Joining => {
                        state = self
                            .shared
                            .cond
                            .wait(state)
                            .expect("chain lock poisoned");
                    }
                    State::Closed | State::Finished => return Ok(()),
                }
            }
        }
        // run cancel hooks under the step locks; a failing hook must not
        // keep the rest from running
        let cancels = self.cancellations.lock().expect("chain lock poisoned");
        for (stepnum, hook) in cancels.iter() {
            self.run_hook(*stepnum, hook, "cancel");
        }
        drop(cancels);
        for step in &self.steps {
            step.shared.cancelled.store(true, Ordering::SeqCst);
            step.shared.cond.notify_all();
        }
        if gentle {
            if let Some(q) = self.queues.first() {
                (q.delayed_disable)();
            }
        } else {
            for q in &self.queues {
                (q.disable)();
            }
        }
        let handles: Vec<_> = {
            let mut w = self.workers.lock().expect("chain lock poisoned");
            w.drain(..).collect()
        };
        for h in handles {
            if h.join().is_err() {
                log::error!("worker panicked during join");
            }
        }
        // post-join: cleanups, then user data teardown source to sink
        let cleanups = self.cleanups.lock().expect("chain lock poisoned");
        for (stepnum, hook) in cleanups.iter() {
            self.run_hook(*stepnum, hook, "cleanup");
        }
        drop(cleanups);
        for step in &self.steps {
            let mut cell = step.shared.lock.lock().expect("step lock poisoned");
            *cell = None;
        }
        {
            let mut state = self.shared.state.lock().expect("chain lock poisoned");
            *state = State::Finished;
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    fn run_hook(&self, stepnum: usize, hook: &Hook, kind: &str) {
        let def = match self.steps.get(stepnum) {
            Some(def) => def,
            None => {
                log::error!("{} hook for unknown step {}", kind, stepnum);
                return;
            }
        };
        let mut cell = def.shared.lock.lock().expect("step lock poisoned");
        if let Some(ud) = cell.as_mut() {
            // the hook may panic; contain it so later hooks still run
            let r = catch_unwind(AssertUnwindSafe(|| hook(ud.as_mut())));
            if r.is_err() {
                log::error!("{} hook for step {} panicked", kind, def.shared.name);
            }
        }
        drop(cell);
        def.shared.cond.notify_all();
    }

    /// Blocks until the chain has drained or was stopped. Safe to call
    /// from several threads at once.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock().expect("chain lock poisoned");
        while matches!(*state, State::Running | State::Joining) {
            state = self.shared.cond.wait(state).expect("chain lock poisoned");
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        let _ = self.stop_inner(false);
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chain[{} steps, {}]",
            self.steps.len(),
            state_name(*self.shared.state.lock().expect("chain lock poisoned"))
        )
    }
}

fn state_name(s: State) -> &'static str {
    match s {
        State::Closed => "closed",
        State::Running => "running",
        State::Drained => "drained",
        State::Joining => "joining",
        State::Finished => "finished",
    }
}

fn run_worker(
    runner: Runner,
    step: Arc<StepShared>,
    chain: Arc<ChainShared>,
    downstream: Option<(QueueThunk, QueueThunk)>,
    upstream: Option<(QueueThunk, QueueThunk)>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| runner()));
    match outcome {
        Ok(Ok(())) => (),
        Ok(Err(e)) => {
            errorqueue::push_error(4, format!("step {}: {}", step.name, e));
        }
        Err(_) => {
            errorqueue::push_error(4, format!("step {}: worker panicked", step.name));
        }
    }
    // last worker of the step seals its edges: no more output will come,
    // and anything still queued upstream is ours alone to refuse
    let last_of_step = {
        let mut live = step.live.lock().expect("step lock poisoned");
        *live -= 1;
        *live == 0
    };
    if last_of_step {
        if let Some((delayed, _)) = downstream {
            delayed();
        }
        if let Some((_, disable)) = upstream {
            disable();
        }
    }
    chain.worker_exited();
}
