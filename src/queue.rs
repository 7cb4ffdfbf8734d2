//! Bounded MPMC queue with a two-phase close protocol.
//!
//! Chains wire adjacent steps together with these queues. A queue starts
//! `Enabled`; `delayed_disable()` refuses further pushes but lets poppers
//! drain what is already queued (end-of-recording semantics), while
//! `disable()` drops queued items on the floor and releases every blocked
//! caller at once. Disabling is one-way, matching the single-shot life of
//! the chain that owns the queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Enabled,
    DelayedDisabled,
    Disabled,
}

struct Inner<T> {
    items: VecDeque<T>,
    state: State,
    dropped: usize,
}

struct Shared<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

/// Handle to a bounded queue; clones refer to the same queue.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Queue {
            shared: Arc::new(Shared {
                capacity,
                inner: Mutex::new(Inner {
                    items: VecDeque::with_capacity(capacity),
                    state: State::Enabled,
                    dropped: 0,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            }),
        }
    }

    /// Pushes an item, waiting while the queue is full. Returns the item
    /// back to the caller once the queue no longer accepts input.
    pub fn push(&self, item: T) -> Result<(), T> {
        let sh = &*self.shared;
        let mut inner = sh.inner.lock().unwrap();
        loop {
            if inner.state != State::Enabled {
                return Err(item);
            }
            if inner.items.len() < sh.capacity {
                inner.items.push_back(item);
                drop(inner);
                sh.not_empty.notify_one();
                return Ok(());
            }
            inner = sh.not_full.wait(inner).unwrap();
        }
    }

    /// Pops the oldest item, waiting while the queue is empty but still
    /// enabled. `None` means the queue is closed for good.
    pub fn pop(&self) -> Option<T> {
        let sh = &*self.shared;
        let mut inner = sh.inner.lock().unwrap();
        loop {
            if inner.state == State::Disabled {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                sh.not_full.notify_one();
                return Some(item);
            }
            if inner.state == State::DelayedDisabled {
                // drained; wake any sibling poppers so they see it too
                drop(inner);
                sh.not_empty.notify_all();
                return None;
            }
            inner = sh.not_empty.wait(inner).unwrap();
        }
    }

    /// Stops accepting input; poppers drain the remaining items.
    pub fn delayed_disable(&self) {
        let sh = &*self.shared;
        let mut inner = sh.inner.lock().unwrap();
        if inner.state == State::Enabled {
            inner.state = State::DelayedDisabled;
        }
        drop(inner);
        sh.not_full.notify_all();
        sh.not_empty.notify_all();
    }

    /// Hard close: queued items are accounted as drops and every blocked
    /// pusher and popper is released.
    pub fn disable(&self) {
        let sh = &*self.shared;
        let mut inner = sh.inner.lock().unwrap();
        if inner.state != State::Disabled {
            inner.state = State::Disabled;
            let lost = inner.items.len();
            inner.dropped += lost;
            inner.items.clear();
            if lost > 0 {
                log::debug!("queue disabled with {} undelivered items", lost);
            }
        }
        drop(inner);
        sh.not_full.notify_all();
        sh.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().unwrap().state != State::Enabled
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of items discarded by `disable()`.
    pub fn drops(&self) -> usize {
        self.shared.inner.lock().unwrap().dropped
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        write!(
            f,
            "Queue({}/{} {:?})",
            inner.items.len(),
            self.shared.capacity,
            inner.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = Queue::new(8);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        assert_eq!((0..5).map(|_| q.pop().unwrap()).collect::<Vec<_>>(), vec![
            0, 1, 2, 3, 4
        ]);
    }

    #[test]
    fn delayed_disable_drains() {
        let q = Queue::new(4);
        q.push("a").unwrap();
        q.push("b").unwrap();
        q.delayed_disable();
        assert!(q.push("c").is_err());
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.pop(), None);
        assert_eq!(q.drops(), 0);
    }

    #[test]
    fn disable_drops_and_releases() {
        let q = Queue::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.disable();
        assert_eq!(q.pop(), None);
        assert_eq!(q.drops(), 2);
        // terminal: a second disable does not double-count
        q.disable();
        assert_eq!(q.drops(), 2);
    }

    #[test]
    fn full_queue_blocks_pusher() {
        let q = Queue::new(1);
        q.push(0u32).unwrap();
        let q2 = q.clone();
        let t = thread::spawn(move || q2.push(1).is_ok());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop(), Some(0));
        assert!(t.join().unwrap());
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn disable_wakes_blocked_popper() {
        let q: Queue<u8> = Queue::new(1);
        let q2 = q.clone();
        let t = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.disable();
        assert_eq!(t.join().unwrap(), None);
    }

    #[test]
    fn every_item_popped_exactly_once() {
        let q = Queue::new(16);
        let n = 1000u32;
        crossbeam::thread::scope(|s| {
            let popped: Vec<_> = (0..4)
                .map(|_| {
                    let q = q.clone();
                    s.spawn(move |_| {
                        let mut got = Vec::new();
                        while let Some(v) = q.pop() {
                            got.push(v);
                        }
                        got
                    })
                })
                .collect();
            for i in 0..n {
                q.push(i).unwrap();
            }
            q.delayed_disable();
            let mut all: Vec<u32> = popped
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            all.sort_unstable();
            assert_eq!(all, (0..n).collect::<Vec<_>>());
        })
        .unwrap();
    }
}
