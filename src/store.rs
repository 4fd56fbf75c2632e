//! The Block Store
//!
//! Ties together the stripe files, the allocator, the node pools, the per-tree lock table, and a
//! superblock catalog into one public surface: `obtain` a generation, `read` a previously-
//! committed block, `load` a superblock, `free` a block back to its pool.
use std::{path::Path, sync::Arc};

use log::{debug, error};

use crate::{
    address::{self, Address},
    allocator::Allocator,
    error::Error,
    generation::Generation,
    node::{self, Coreblock, Datablock, NodeKind, Vectorblock, K},
    pool::NodePools,
    stripe::StripeSet,
    superblock::{self, Superblock, SuperblockCatalog, TreeId, LATEST},
    locktable::LockTable,
};

/// Default stripe fan-out (`F`).
pub const DEFAULT_STRIPE_COUNT: u16 = 8;

/// The append-only, striped block store for one directory's worth of trees.
pub struct BlockStore {
    stripes: Arc<StripeSet>,
    allocator: Allocator,
    pools: NodePools,
    locks: LockTable,
    catalog: Box<dyn SuperblockCatalog>,
}

impl BlockStore {
    /// Open (creating if necessary) a block store rooted at `dir`, publishing superblocks to
    /// `catalog`, with `f` stripe files.
    ///
    /// The catalog is taken here as an already-constructed `SuperblockCatalog` implementation
    /// rather than a connection string, since the catalog is modeled as an in-crate trait (see
    /// `superblock.rs`); there is no cache-size parameter because the node pools are unbounded
    /// soft caches, not a sized LRU.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        catalog: Box<dyn SuperblockCatalog>,
        f: u16,
    ) -> Result<Self, Error> {
        let stripes = Arc::new(StripeSet::open(dir.as_ref(), f)?);
        let allocator = Allocator::new(stripes.clone());
        debug!("opened block store at {:?} with {} stripes", dir.as_ref(), f);
        Ok(BlockStore {
            stripes,
            allocator,
            pools: NodePools::new(),
            locks: LockTable::new(),
            catalog,
        })
    }

    /// Open with the default stripe count (`F = 8`).
    pub fn open_default<P: AsRef<Path>>(
        dir: P,
        catalog: Box<dyn SuperblockCatalog>,
    ) -> Result<Self, Error> {
        Self::open(dir, catalog, DEFAULT_STRIPE_COUNT)
    }

    /// Open with `f` stripes that extend `alloc_inc` blocks at a time instead of the
    /// default `ALLOC_INC`. Exposed mainly so tests can exercise file expansion cheaply.
    pub fn open_with_alloc_inc<P: AsRef<Path>>(
        dir: P,
        catalog: Box<dyn SuperblockCatalog>,
        f: u16,
        alloc_inc: u64,
    ) -> Result<Self, Error> {
        let stripes = Arc::new(crate::stripe::StripeSet::open_with_alloc_inc(
            dir.as_ref(),
            f,
            alloc_inc,
        )?);
        let allocator = Allocator::new(stripes.clone());
        debug!(
            "opened block store at {:?} with {} stripes (alloc_inc={})",
            dir.as_ref(),
            f,
            alloc_inc
        );
        Ok(BlockStore {
            stripes,
            allocator,
            pools: NodePools::new(),
            locks: LockTable::new(),
            catalog,
        })
    }

    /// Obtain a new generation for `tree_id`, blocking until any other in-flight generation for
    /// the same tree has committed or been abandoned.
    pub fn obtain_generation(&self, tree_id: TreeId) -> Result<Generation<'_>, Error> {
        let lock = self.locks.acquire(&tree_id);

        let cur_sb = match superblock::load(&*self.catalog, &tree_id, LATEST)? {
            Some(sb) => sb,
            None => Superblock::empty(tree_id),
        };

        Ok(Generation::new(
            cur_sb,
            lock,
            &self.allocator,
            &self.stripes,
            &self.pools,
            &*self.catalog,
        ))
    }

    /// Load a superblock by generation, or `LATEST` for the newest committed one.
    pub fn load_superblock(
        &self,
        tree_id: &TreeId,
        gen: u64,
    ) -> Result<Option<Superblock>, Error> {
        superblock::load(&*self.catalog, tree_id, gen)
    }

    /// Read and deserialize the datablock at `addr`.
    ///
    /// This borrows a buffer from the buffer pool for the raw read and returns it once the frame
    /// is deserialized. The node returned is owned by the caller until it is
    /// handed back via `free_coreblock`/`free_vectorblock`, at which point it rejoins the node
    /// pool `allocate_coreblock`/`allocate_vectorblock` draw from.
    ///
    /// A Coreblock's `children` are addresses that were deserialized off disk rather than minted
    /// by this store, so each occupied slot's stripe component is range-checked against the
    /// current stripe count before the block is handed back.
    pub fn read_datablock(&self, addr: Address) -> Result<Datablock, Error> {
        let mut buf = self.pools.buffer.get();
        let result = self.stripes.read_block(addr, &mut buf).and_then(|()| {
            match node::read_buffer_type(&buf) {
                Ok(NodeKind::Core) => {
                    let core = node::deserialize_core(&buf)?;
                    self.check_children(&core)?;
                    Ok(Datablock::Core(core))
                }
                Ok(NodeKind::Vector) => Ok(Datablock::Vector(node::deserialize_vector(&buf)?)),
                Err(Error::DatablockNotFound(_)) => Err(Error::DatablockNotFound(addr)),
                Err(e) => {
                    error!("corrupt frame at address {:#x}: {}", addr, e);
                    Err(e)
                }
            }
        });
        self.pools.buffer.put(buf);
        result
    }

    fn check_children(&self, core: &Coreblock) -> Result<(), Error> {
        let occupied = (core.count as usize).min(K);
        for &child in &core.children[..occupied] {
            if child != address::INVALID_ADDRESS {
                address::check_stripe(address::stripe(child), self.stripes.count())?;
            }
        }
        Ok(())
    }

    /// Return a Coreblock to its pool.
    pub fn free_coreblock(&self, node: Coreblock) {
        self.pools.core.put(node);
    }

    /// Return a Vectorblock to its pool.
    pub fn free_vectorblock(&self, node: Vectorblock) {
        self.pools.vector.put(node);
    }

    /// Remove every superblock record for `tree_id`. Debug/test only.
    pub fn debug_delete_tree(&self, tree_id: &TreeId) -> Result<(), Error> {
        self.catalog.delete_all(tree_id)
    }

    /// Current `(nxtblock, maxblock)` for stripe `s`. Diagnostic only.
    pub fn stripe_extents(&self, s: u16) -> (u64, u64) {
        self.stripes.extents(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::superblock::MemoryCatalog;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join("tstree_blockstore_test")
            .join("store")
            .join(name);
        std::fs::remove_dir_all(&dir).unwrap_or_default();
        dir
    }

    #[test]
    fn fresh_tree_has_empty_superblock() {
        init();
        let dir = test_dir("fresh_tree_has_empty_superblock");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("fresh");

        let gen = store.obtain_generation(tree).unwrap();
        assert_eq!(gen.previous().gen(), 0);
        assert_eq!(gen.previous().root(), 0);
        assert_eq!(gen.number(), 1);
    }

    #[test]
    fn allocate_write_commit_read_back() {
        init();
        let dir = test_dir("allocate_write_commit_read_back");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("rw");

        let mut gen = store.obtain_generation(tree.clone()).unwrap();
        let addr = {
            let c = gen.allocate_coreblock().unwrap();
            c.children[0] = 0xdead;
            c.count = 1;
            c.this_addr()
        };
        gen.update_root_addr(addr);
        let sb = gen.commit().unwrap();
        assert_eq!(sb.gen(), 1);
        assert_eq!(sb.root(), addr);

        match store.read_datablock(addr).unwrap() {
            Datablock::Core(c) => {
                assert_eq!(c.children[0], 0xdead);
                assert_eq!(c.count, 1);
            }
            Datablock::Vector(_) => panic!("expected a Coreblock"),
        }

        let latest = store.load_superblock(&tree, LATEST).unwrap().unwrap();
        assert_eq!(latest.root(), addr);
    }

    #[test]
    fn second_commit_is_already_flushed() {
        init();
        let dir = test_dir("second_commit_is_already_flushed");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("double-commit");

        let mut gen = store.obtain_generation(tree).unwrap();
        gen.allocate_vectorblock().unwrap();
        assert!(gen.commit().is_ok());
        assert_matches::assert_matches!(gen.commit(), Err(Error::AlreadyFlushed));
    }

    #[test]
    fn abandoned_generation_releases_lock_and_recycles_blocks() {
        init();
        let dir = test_dir("abandoned_generation_releases_lock_and_recycles_blocks");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("abandoned");

        {
            let mut gen = store.obtain_generation(tree.clone()).unwrap();
            gen.allocate_coreblock().unwrap();
            // dropped without commit
        }

        // lock must have been released: a second obtain must not block.
        let gen2 = store.obtain_generation(tree.clone()).unwrap();
        assert_eq!(gen2.previous().gen(), 0, "no superblock should have been published");
    }

    #[test]
    fn second_generation_chains_off_first() {
        init();
        let dir = test_dir("second_generation_chains_off_first");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("chain");

        let mut gen1 = store.obtain_generation(tree.clone()).unwrap();
        let addr1 = gen1.allocate_coreblock().unwrap().this_addr();
        gen1.update_root_addr(addr1);
        gen1.commit().unwrap();

        let mut gen2 = store.obtain_generation(tree.clone()).unwrap();
        assert_eq!(gen2.previous().gen(), 1);
        assert_eq!(gen2.previous().root(), addr1);
        assert_eq!(gen2.number(), 2);

        let addr2 = gen2.allocate_vectorblock().unwrap().this_addr();
        gen2.update_root_addr(addr2);
        let sb2 = gen2.commit().unwrap();

        assert_eq!(sb2.gen(), 2);
        assert_eq!(sb2.root(), addr2);
        assert_eq!(
            store.load_superblock(&tree, 1).unwrap().unwrap().root(),
            addr1
        );
    }

    #[test]
    fn reading_an_allocated_but_unwritten_block_is_not_found() {
        init();
        let dir = test_dir("reading_an_allocated_but_unwritten_block_is_not_found");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("sparse");

        // allocate reserves the address but the commit never writes it (abandoned generation).
        let mut gen = store.obtain_generation(tree).unwrap();
        let addr = gen.allocate_coreblock().unwrap().this_addr();
        drop(gen);

        assert_matches::assert_matches!(
            store.read_datablock(addr),
            Err(Error::DatablockNotFound(a)) if a == addr
        );
    }

    #[test]
    fn coreblock_with_out_of_range_child_stripe_is_rejected_on_read() {
        init();
        let dir = test_dir("coreblock_with_out_of_range_child_stripe_is_rejected_on_read");
        let store = BlockStore::open(&dir, Box::new(MemoryCatalog::new()), 4).unwrap();
        let tree = TreeId::new("bad-child");

        let mut gen = store.obtain_generation(tree).unwrap();
        let addr = {
            let c = gen.allocate_coreblock().unwrap();
            // F is 4 here, so stripe 4 is out of range -- simulates a corrupted child pointer.
            c.children[0] = crate::address::make(4, 1);
            c.count = 1;
            c.this_addr()
        };
        gen.update_root_addr(addr);
        gen.commit().unwrap();

        assert_matches::assert_matches!(store.read_datablock(addr), Err(Error::Misuse(_)));
    }
}
