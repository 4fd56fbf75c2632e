//! Datablocks: Coreblock and Vectorblock
//!
//! The tree algorithm itself is out of scope here -- this module only owns the two
//! node shapes the tree module fills in, and the frame format that gets them to and from a
//! `B`-byte buffer. Everything downstream (the allocator, the pools, the commit path) treats a
//! `Coreblock`/`Vectorblock` as an opaque value with a known address and generation.

use serde_derive::{Deserialize, Serialize};

use crate::{address::Address, error::Error};

/// Branching factor of an internal (Core) node: `K = 1 << PWFACTOR`.
pub const PWFACTOR: u8 = 6;
/// `K = 64`.
pub const K: usize = 1 << PWFACTOR as usize;
/// Number of entries in a leaf (Vector) node.
///
/// `entries` is a fixed-size `[(i64, f64); VSIZE]`, which bincode encodes as `16 * VSIZE` bytes
/// with no framing overhead; together with `this_addr`(8) + `generation`(8) + `count`(2) + the
/// 1-byte tag, a Vectorblock frame is `19 + 16 * VSIZE` bytes. `VSIZE` is picked so that this
/// stays under `DBSIZE`.
pub const VSIZE: usize = 250;
/// Size, in bytes, of a serialized block frame. Fixed so that every stripe file is a flat array
/// of `B`-byte slots.
pub const DBSIZE: usize = 4096;

/// Frame discriminator byte for a Coreblock.
const TAG_CORE: u8 = 1;
/// Frame discriminator byte for a Vectorblock.
const TAG_VECTOR: u8 = 2;

/// Which of the two node shapes a serialized frame holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// An internal tree node.
    Core,
    /// A leaf tree node.
    Vector,
}

/// An internal tree node: up to `K` child addresses.
///
/// `This_addr` and `Generation` are set once, at allocation, and never mutated afterwards; the
/// core never interprets `children` beyond moving them in and out of frames.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Coreblock {
    this_addr: Address,
    generation: u64,
    /// Child block addresses; `0` marks an empty slot.
    pub children: [Address; K],
    /// Number of occupied slots in `children`.
    pub count: u16,
}

/// A leaf tree node: up to `VSIZE` (timestamp, value) entries.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Vectorblock {
    this_addr: Address,
    generation: u64,
    /// Time-series entries owned by the tree module; the core never reads them.
    pub entries: [(i64, f64); VSIZE],
    /// Number of occupied slots in `entries`.
    pub count: u16,
}

/// A Coreblock or a Vectorblock, returned from the read path once the type tag has been
/// resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum Datablock {
    /// An internal node.
    Core(Coreblock),
    /// A leaf node.
    Vector(Vectorblock),
}

impl Coreblock {
    /// The "zero value": every field reset, ready to be re-initialized by a caller that pulled
    /// this instance from a pool. Pools give no freshness guarantee, so callers
    /// must start from here.
    pub fn zeroed() -> Self {
        Coreblock {
            this_addr: 0,
            generation: 0,
            children: [0; K],
            count: 0,
        }
    }

    /// Reset an existing (possibly pool-recycled) instance in place to the zero value.
    pub fn reset(&mut self) {
        *self = Coreblock::zeroed();
    }

    /// Self-address, set at allocation and never mutated thereafter.
    pub fn this_addr(&self) -> Address {
        self.this_addr
    }

    /// The generation that produced this block.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_identity(&mut self, addr: Address, generation: u64) {
        self.this_addr = addr;
        self.generation = generation;
    }
}

impl Vectorblock {
    /// The "zero value" for a freshly-pooled instance.
    pub fn zeroed() -> Self {
        Vectorblock {
            this_addr: 0,
            generation: 0,
            entries: [(0, 0.0); VSIZE],
            count: 0,
        }
    }

    /// Reset an existing (possibly pool-recycled) instance in place to the zero value.
    pub fn reset(&mut self) {
        *self = Vectorblock::zeroed();
    }

    /// Self-address, set at allocation and never mutated thereafter.
    pub fn this_addr(&self) -> Address {
        self.this_addr
    }

    /// The generation that produced this block.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_identity(&mut self, addr: Address, generation: u64) {
        self.this_addr = addr;
        self.generation = generation;
    }
}

/// Frame discriminator for a slot a stripe file has reserved (by pre-extension) but that no
/// commit has ever written to: the file is zero-filled on growth, so an untouched slot's tag
/// byte reads back as `0`.
const TAG_EMPTY: u8 = 0;

/// Inspect a serialized frame's discriminator byte without fully deserializing it.
///
/// A `0` tag means the slot was never written -- distinct from a recognized-but-wrong tag,
/// which means the bytes there are neither empty nor a valid frame.
pub fn read_buffer_type(buf: &[u8]) -> Result<NodeKind, Error> {
    match buf.get(0) {
        Some(&TAG_CORE) => Ok(NodeKind::Core),
        Some(&TAG_VECTOR) => Ok(NodeKind::Vector),
        Some(&TAG_EMPTY) => Err(Error::DatablockNotFound(0)),
        Some(&other) => Err(Error::CorruptFrame(other)),
        None => Err(Error::Misuse("empty frame buffer".into())),
    }
}

/// Serialize a Coreblock into a fixed `DBSIZE`-byte frame: tag byte followed by a bincode
/// encoding of the node, zero-padded to `DBSIZE`.
pub fn serialize_core(node: &Coreblock, buf: &mut [u8]) -> Result<(), Error> {
    serialize_tagged(TAG_CORE, node, buf)
}

/// Serialize a Vectorblock into a fixed `DBSIZE`-byte frame.
pub fn serialize_vector(node: &Vectorblock, buf: &mut [u8]) -> Result<(), Error> {
    serialize_tagged(TAG_VECTOR, node, buf)
}

fn serialize_tagged<T: serde::Serialize>(tag: u8, node: &T, buf: &mut [u8]) -> Result<(), Error> {
    assert_eq!(
        buf.len(),
        DBSIZE,
        "serialize buffer must be exactly DBSIZE bytes"
    );
    let encoded = bincode::serialize(node).map_err(|_| Error::CorruptFrame(tag))?;
    assert!(
        encoded.len() + 1 <= DBSIZE,
        "encoded node ({} bytes) does not fit in a {}-byte frame",
        encoded.len(),
        DBSIZE
    );
    buf[0] = tag;
    for b in &mut buf[1..] {
        *b = 0;
    }
    buf[1..1 + encoded.len()].copy_from_slice(&encoded);
    Ok(())
}

/// Deserialize a Coreblock from a frame previously identified as `NodeKind::Core`.
pub fn deserialize_core(buf: &[u8]) -> Result<Coreblock, Error> {
    bincode::deserialize(&buf[1..]).map_err(|_| Error::CorruptFrame(TAG_CORE))
}

/// Deserialize a Vectorblock from a frame previously identified as `NodeKind::Vector`.
pub fn deserialize_vector(buf: &[u8]) -> Result<Vectorblock, Error> {
    bincode::deserialize(&buf[1..]).map_err(|_| Error::CorruptFrame(TAG_VECTOR))
}
