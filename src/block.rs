//! Reference-counted data blocks and the pools they are drawn from.
//!
//! Every producing step in a chain owns a [`BlockPool`] with a fixed
//! element size and a bound on the number of blocks that may be out at any
//! one time. A freshly drawn [`BlockMut`] is writable by exactly one owner;
//! freezing it yields a cheaply clonable [`Block`] that downstream steps
//! share. The backing slab returns to its pool when the last holder drops.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, Weak};

struct PoolState {
    free: Vec<Box<[u8]>>,
    outstanding: usize,
}

struct PoolShared {
    block_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl PoolShared {
    fn put_back(&self, slab: Box<[u8]>) {
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        // keep at most `capacity` slabs around for reuse
        if st.free.len() < self.capacity {
            st.free.push(slab);
        }
        drop(st);
        self.returned.notify_one();
    }
}

/// Bounded pool of fixed-size byte slabs.
///
/// `get()` blocks the caller while `capacity` blocks are outstanding and no
/// released slab is available yet.
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    pub fn new(block_size: usize, capacity: usize) -> Self {
        assert!(block_size > 0 && capacity > 0);
        BlockPool {
            shared: Arc::new(PoolShared {
                block_size,
                capacity,
                state: Mutex::new(PoolState {
                    free: Vec::with_capacity(capacity),
                    outstanding: 0,
                }),
                returned: Condvar::new(),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Draws a writable block, waiting for a slab to come back if the pool
    /// is at capacity.
    pub fn get(&self) -> BlockMut {
        let slab = {
            let mut st = self.shared.state.lock().unwrap();
            loop {
                if let Some(slab) = st.free.pop() {
                    st.outstanding += 1;
                    break slab;
                }
                if st.outstanding < self.shared.capacity {
                    st.outstanding += 1;
                    break vec![0u8; self.shared.block_size].into_boxed_slice();
                }
                st = self.shared.returned.wait(st).unwrap();
            }
        };
        BlockMut {
            slab: Some(slab),
            len: self.shared.block_size,
            pool: Arc::clone(&self.shared),
        }
    }

    /// Non-blocking variant; `None` if the pool is exhausted.
    pub fn try_get(&self) -> Option<BlockMut> {
        let mut st = self.shared.state.lock().unwrap();
        let slab = match st.free.pop() {
            Some(slab) => slab,
            None if st.outstanding < self.shared.capacity => {
                vec![0u8; self.shared.block_size].into_boxed_slice()
            }
            None => return None,
        };
        st.outstanding += 1;
        drop(st);
        Some(BlockMut {
            slab: Some(slab),
            len: self.shared.block_size,
            pool: Arc::clone(&self.shared),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().unwrap().outstanding
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock().unwrap();
        write!(
            f,
            "BlockPool({}B x {}, {} out)",
            self.shared.block_size, self.shared.capacity, st.outstanding
        )
    }
}

/// Uniquely owned, writable block. Freeze to share it downstream.
pub struct BlockMut {
    slab: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl BlockMut {
    pub fn data(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.slab.as_mut().unwrap()[..len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shortens the valid region, e.g. after a partial read filled it.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.slab.as_ref().unwrap().len());
        self.len = len;
    }

    pub fn freeze(mut self) -> Block {
        Block {
            inner: Arc::new(Slab {
                data: self.slab.take(),
                pool: Arc::downgrade(&self.pool),
            }),
            base: 0,
            len: self.len,
        }
    }
}

impl Drop for BlockMut {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.pool.put_back(slab);
        }
    }
}

struct Slab {
    data: Option<Box<[u8]>>,
    pool: Weak<PoolShared>,
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let Some(slab) = self.data.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.put_back(slab);
            }
        }
    }
}

/// Read-only view of (part of) a pooled slab. Clones share the slab; the
/// slab goes back to its pool when the last clone drops.
#[derive(Clone)]
pub struct Block {
    inner: Arc<Slab>,
    base: usize,
    len: usize,
}

impl Block {
    /// Copies `data` into a one-off block not tied to any pool. Mostly
    /// useful in tests and for tiny control payloads.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Block {
            inner: Arc::new(Slab {
                data: Some(data.into_boxed_slice()),
                pool: Weak::new(),
            }),
            base: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-view into the same slab; panics if out of range.
    pub fn sub(&self, offset: usize, len: usize) -> Block {
        assert!(offset + len <= self.len);
        Block {
            inner: Arc::clone(&self.inner),
            base: self.base + offset,
            len,
        }
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner.data.as_ref().unwrap()[self.base..self.base + self.len]
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block[{}+{}]", self.base, self.len)
    }
}

/// A block labelled with the logical stream it belongs to.
#[derive(Clone, Debug)]
pub struct TaggedBlock {
    pub tag: u32,
    pub block: Block,
}
