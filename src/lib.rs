#![warn(missing_docs)]
//! Block-storage core for a versioned time-series tree store
//!
//! This crate is the storage layer underneath a B-tree-like time-series index: it persists
//! opaque tree nodes (`Coreblock`, `Vectorblock`) to a striped set of append-only block files,
//! serializes writers per tree into linear generations, and publishes each generation's root by
//! inserting a superblock record into a pluggable metadata catalog.
//!
//! The tree algorithm itself -- indexing, aggregate rollups, query answering -- lives above this
//! crate and is out of scope here; see the module docs on [`generation`] for the write path and
//! [`store`] for the top-level API.

mod address;
mod allocator;
mod error;
mod generation;
mod locktable;
mod node;
mod pool;
mod stripe;
mod superblock;
mod store;

pub use crate::{
    address::{Address, BlockOffset, StripeIndex, INVALID_ADDRESS},
    error::Error,
    generation::Generation,
    node::{Coreblock, Datablock, NodeKind, Vectorblock, DBSIZE, K, PWFACTOR, VSIZE},
    stripe::ALLOC_INC,
    store::{BlockStore, DEFAULT_STRIPE_COUNT},
    superblock::{FileCatalog, MemoryCatalog, Superblock, SuperblockCatalog, SuperblockRecord, TreeId, LATEST},
};
