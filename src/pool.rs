//! Node and Buffer Pools
//!
//! Fixed-size buffers and tree nodes churn heavily during a write pass: every allocate/commit
//! touches one. Rather than allocate and drop them, the store keeps three unbounded soft caches
//! (Coreblock, Vectorblock, and `DBSIZE`-byte buffers) that callers `get()` from and `put()` back
//! to. There is no freshness guarantee across a `get`/`put` pair -- callers must reset state
//! themselves (`Coreblock::zeroed()`/`Vectorblock::zeroed()`).
//!
//! Backed by `crossbeam`'s lock-free `SegQueue`, a thread-safe multi-producer multi-consumer
//! cache without the overhead of a mutex-guarded `Vec`.
use crossbeam::queue::SegQueue;

use crate::node::{Coreblock, Vectorblock, DBSIZE};

/// A soft cache of reusable `T` instances.
///
/// `get` returns a previously `put` instance if one is available, or constructs a fresh one.
/// `put` offers an instance back for later reuse. There is no contract about which instance a
/// `get` returns, nor about ordering between a `put` and a later `get`.
pub struct Pool<T> {
    free: SegQueue<T>,
    new: fn() -> T,
}

impl<T> Pool<T> {
    /// Build a pool whose fallback constructor is `new`.
    pub fn new(new: fn() -> T) -> Self {
        Pool {
            free: SegQueue::new(),
            new,
        }
    }

    /// Obtain an instance, reusing a pooled one if available.
    pub fn get(&self) -> T {
        match self.free.pop() {
            Ok(t) => t,
            Err(_) => (self.new)(),
        }
    }

    /// Return an instance to the pool for later reuse.
    pub fn put(&self, t: T) {
        self.free.push(t);
    }
}

/// Pools shared by a `BlockStore`: one per node kind plus one for write/read buffers.
pub struct NodePools {
    /// Recycled `Coreblock` instances.
    pub core: Pool<Coreblock>,
    /// Recycled `Vectorblock` instances.
    pub vector: Pool<Vectorblock>,
    /// Recycled `DBSIZE`-byte I/O buffers.
    pub buffer: Pool<Vec<u8>>,
}

impl NodePools {
    /// Construct empty pools; `get()` falls back to `Coreblock::zeroed()`,
    /// `Vectorblock::zeroed()`, and a zero-filled `DBSIZE`-byte `Vec`, respectively.
    pub fn new() -> Self {
        NodePools {
            core: Pool::new(Coreblock::zeroed),
            vector: Pool::new(Vectorblock::zeroed),
            buffer: Pool::new(|| vec![0u8; DBSIZE]),
        }
    }
}

impl Default for NodePools {
    fn default() -> Self {
        NodePools::new()
    }
}
