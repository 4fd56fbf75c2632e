//! Generations: the Transactional Write Handle
//!
//! A `Generation` is what `obtain_generation` hands a writer: it owns a pending set of dirty
//! Core/Vector blocks, a reference to the previous superblock, and a draft of the new one.
//! Between `obtain` and `commit` it exclusively owns its dirty blocks; after commit they are
//! returned to the pools and the generation is inert.
use std::collections::HashSet;

use log::{debug, error};

use crate::{
    address::{self, Address},
    allocator::Allocator,
    error::Error,
    locktable::TreeLockGuard,
    node::{Coreblock, Vectorblock},
    pool::NodePools,
    stripe::StripeSet,
    superblock::{Superblock, SuperblockCatalog, SuperblockRecord, TreeId},
};

/// Where a `Generation` is in its obtain-to-commit lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    /// Lock held, dirty lists mutable.
    Draft,
    /// Terminal: all dirty blocks returned to pools, lock released.
    Flushed,
}

/// A single write transaction on one tree. Produces exactly one new superblock on `commit`.
pub struct Generation<'a> {
    cur_sb: Superblock,
    new_root: u64,
    new_gen: u64,
    cblocks: Vec<Coreblock>,
    vblocks: Vec<Vectorblock>,
    state: State,
    // Held for the whole Draft lifetime; dropped (releasing the per-tree lock) either by
    // `commit` or by this struct's own `Drop`.
    _lock: Option<TreeLockGuard>,

    allocator: &'a Allocator,
    stripes: &'a StripeSet,
    pools: &'a NodePools,
    catalog: &'a (dyn SuperblockCatalog + 'a),
}

impl<'a> Generation<'a> {
    pub(crate) fn new(
        cur_sb: Superblock,
        lock: TreeLockGuard,
        allocator: &'a Allocator,
        stripes: &'a StripeSet,
        pools: &'a NodePools,
        catalog: &'a (dyn SuperblockCatalog + 'a),
    ) -> Self {
        let new_gen = cur_sb.gen() + 1;
        let new_root = cur_sb.root();
        Generation {
            cur_sb,
            new_root,
            new_gen,
            cblocks: Vec::with_capacity(32),
            vblocks: Vec::with_capacity(32),
            state: State::Draft,
            _lock: Some(lock),
            allocator,
            stripes,
            pools,
            catalog,
        }
    }

    /// The tree this generation belongs to.
    pub fn tree_id(&self) -> &TreeId {
        self.cur_sb.tree_id()
    }

    /// The generation number this write pass will publish: `Cur_SB.gen + 1`.
    pub fn number(&self) -> u64 {
        self.new_gen
    }

    /// The previous, already-committed superblock this generation was obtained from.
    pub fn previous(&self) -> &Superblock {
        &self.cur_sb
    }

    fn require_draft(&self) {
        assert_eq!(
            self.state,
            State::Draft,
            "operation is illegal once a Generation has been flushed"
        );
    }

    /// Allocate a fresh Coreblock: reserves an address on disk (the stripe file is already sized
    /// to include it) but does not write anything yet.
    pub fn allocate_coreblock(&mut self) -> Result<&mut Coreblock, Error> {
        self.require_draft();
        let mut node = self.pools.core.get();
        node.reset();
        let addr = self.allocator.allocate_block()?;
        node.set_identity(addr, self.new_gen);
        self.cblocks.push(node);
        Ok(self.cblocks.last_mut().unwrap())
    }

    /// Allocate a fresh Vectorblock, symmetric to `allocate_coreblock`.
    pub fn allocate_vectorblock(&mut self) -> Result<&mut Vectorblock, Error> {
        self.require_draft();
        let mut node = self.pools.vector.get();
        node.reset();
        let addr = self.allocator.allocate_block()?;
        node.set_identity(addr, self.new_gen);
        self.vblocks.push(node);
        Ok(self.vblocks.last_mut().unwrap())
    }

    /// Set the new superblock's root address. Callable any number of times before commit.
    pub fn update_root_addr(&mut self, addr: Address) {
        self.require_draft();
        self.new_root = addr;
    }

    /// Serialize and write every dirty block, barrier the touched stripes, then publish the new
    /// superblock. A second call on an already-flushed generation is a no-op that returns
    /// `AlreadyFlushed` -- unlike a design that consumes `self` by value, this keeps the
    /// generation object alive and inspectable after commit.
    pub fn commit(&mut self) -> Result<Superblock, Error> {
        if self.state == State::Flushed {
            return Err(Error::AlreadyFlushed);
        }

        let mut touched: HashSet<u16> = HashSet::new();

        for cb in self.cblocks.drain(..) {
            touched.insert(address::stripe(cb.this_addr()));
            write_core_and_free(self.stripes, self.pools, cb)?;
        }
        for vb in self.vblocks.drain(..) {
            touched.insert(address::stripe(vb.this_addr()));
            write_vector_and_free(self.stripes, self.pools, vb)?;
        }

        for s in &touched {
            self.stripes.barrier(*s).map_err(|e| {
                error!("barrier failed for stripe {}: {}", s, e);
                e
            })?;
        }

        let new_sb =
            Superblock::new(self.cur_sb.tree_id().clone(), self.new_gen, self.new_root);

        debug!(
            "inserting superblock tree={} gen={} root={:#x}",
            new_sb.tree_id(),
            new_sb.gen(),
            new_sb.root()
        );

        self.catalog
            .insert(SuperblockRecord::from_superblock(&new_sb))
            .map_err(|e| {
                error!(
                    "fatal: superblock insert failed for tree={} gen={}: {}",
                    new_sb.tree_id(),
                    new_sb.gen(),
                    e
                );
                e
            })?;

        self.state = State::Flushed;
        self._lock.take();

        Ok(new_sb)
    }
}

fn write_core_and_free(
    stripes: &StripeSet,
    pools: &NodePools,
    node: Coreblock,
) -> Result<(), Error> {
    let mut buf = pools.buffer.get();
    crate::node::serialize_core(&node, &mut buf)?;
    let result = stripes.write_block(node.this_addr(), &buf);
    pools.buffer.put(buf);
    pools.core.put(node);
    result
}

fn write_vector_and_free(
    stripes: &StripeSet,
    pools: &NodePools,
    node: Vectorblock,
) -> Result<(), Error> {
    let mut buf = pools.buffer.get();
    crate::node::serialize_vector(&node, &mut buf)?;
    let result = stripes.write_block(node.this_addr(), &buf);
    pools.buffer.put(buf);
    pools.vector.put(node);
    result
}

impl<'a> Drop for Generation<'a> {
    /// An abandoned Draft generation (dropped without `commit`) releases its per-tree lock and
    /// returns its allocated-but-unwritten blocks to the pools, rather than leaking the lock
    /// forever. It never publishes a superblock.
    fn drop(&mut self) {
        if self.state == State::Draft {
            for cb in self.cblocks.drain(..) {
                self.pools.core.put(cb);
            }
            for vb in self.vblocks.drain(..) {
                self.pools.vector.put(vb);
            }
        }
        // `_lock` drops here regardless of state, releasing the per-tree mutex exactly once.
    }
}
