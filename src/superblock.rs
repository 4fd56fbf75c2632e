//! Superblocks and the Metadata Catalog
//!
//! A superblock is the tuple `(tree_id, gen, root_addr)` naming the root of one committed
//! generation of one tree. The catalog that stores these lives outside this crate in a real
//! deployment; this module models that boundary as a trait (`SuperblockCatalog`) so the crate
//! is usable standalone, with two adapters: an in-memory one for tests/embedding, and a simple
//! append-only file-backed one that behaves like the "external ordered-record store" the core
//! assumes.
use std::{
    fs::OpenOptions,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use log::{debug, error};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Sentinel requesting "the highest committed generation" from `LoadSuperblock`.
pub const LATEST: u64 = u64::max_value();

/// Namespace all `TreeId`s derive from.
fn namespace() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, b"tstree-blockstore")
}

/// A tree's identity. Wraps a v5 UUID so trees have a stable, typed, `Display`-able identifier
/// instead of a bare string, while still exposing the string form the catalog keys on.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TreeId(Uuid);

impl TreeId {
    /// Derive a `TreeId` deterministically from a name, so tests and callers can refer to "the
    /// same tree" without persisting a generated id somewhere first.
    pub fn new<N: AsRef<[u8]>>(name: N) -> Self {
        TreeId(Uuid::new_v5(&namespace(), name.as_ref()))
    }
}

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(tree_id, gen, root_addr)`. `gen` is strictly increasing per tree; `root` is `0` iff the
/// tree has never committed.
#[derive(Clone, Debug, PartialEq)]
pub struct Superblock {
    tree_id: TreeId,
    gen: u64,
    root: u64,
}

impl Superblock {
    /// The superblock of a tree that has never committed: `gen = 0`, `root = 0`.
    pub fn empty(tree_id: TreeId) -> Self {
        Superblock {
            tree_id,
            gen: 0,
            root: 0,
        }
    }

    /// Construct a superblock with an explicit generation and root.
    pub fn new(tree_id: TreeId, gen: u64, root: u64) -> Self {
        Superblock { tree_id, gen, root }
    }

    /// This superblock's tree.
    pub fn tree_id(&self) -> &TreeId {
        &self.tree_id
    }

    /// This superblock's generation number.
    pub fn gen(&self) -> u64 {
        self.gen
    }

    /// This superblock's root block address (`0` means empty).
    pub fn root(&self) -> u64 {
        self.root
    }

    fn from_record(record: &SuperblockRecord) -> Self {
        Superblock {
            tree_id: TreeId(Uuid::parse_str(&record.uuid).expect("catalog stored a bad uuid")),
            gen: record.gen,
            root: record.root,
        }
    }
}

/// The persisted form of a superblock, as the catalog's own schema specifies:
/// `{Uuid: string, Gen: u64, Root: u64}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SuperblockRecord {
    /// String form of the tree id.
    pub uuid: String,
    /// Generation number.
    pub gen: u64,
    /// Root block address.
    pub root: u64,
}

impl SuperblockRecord {
    pub(crate) fn from_superblock(sb: &Superblock) -> Self {
        SuperblockRecord {
            uuid: sb.tree_id.to_string(),
            gen: sb.gen,
            root: sb.root,
        }
    }
}

/// The external metadata catalog's required capabilities: insert, find-latest, find-by-
/// generation, and a debug/test delete-all.
pub trait SuperblockCatalog: Send + Sync {
    /// Insert a new superblock record. Callers guarantee `(uuid, gen)` uniqueness; no uniqueness
    /// constraint is enforced here.
    fn insert(&self, record: SuperblockRecord) -> Result<(), Error>;

    /// The highest-`gen` record for `tree_id`, or `None` if there is none.
    fn find_latest(&self, tree_id: &TreeId) -> Result<Option<SuperblockRecord>, Error>;

    /// The exact `(tree_id, gen)` record, or `None` if there is none.
    fn find_by_gen(&self, tree_id: &TreeId, gen: u64) -> Result<Option<SuperblockRecord>, Error>;

    /// Remove every record for `tree_id`. Debug/test only.
    fn delete_all(&self, tree_id: &TreeId) -> Result<(), Error>;
}

/// Load a superblock by generation, or `LATEST` for the highest committed one.
pub fn load<C: SuperblockCatalog + ?Sized>(
    catalog: &C,
    tree_id: &TreeId,
    gen: u64,
) -> Result<Option<Superblock>, Error> {
    let record = if gen == LATEST {
        catalog.find_latest(tree_id)?
    } else {
        catalog.find_by_gen(tree_id, gen)?
    };
    Ok(record.map(|r| Superblock::from_record(&r)))
}

/// An in-memory catalog: a `RwLock`-guarded `Vec` scanned linearly. Intended for tests and for
/// embedders who layer their own durable catalog beneath a cache built on this trait.
#[derive(Default)]
pub struct MemoryCatalog {
    records: RwLock<Vec<SuperblockRecord>>,
}

impl MemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        MemoryCatalog {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl SuperblockCatalog for MemoryCatalog {
    fn insert(&self, record: SuperblockRecord) -> Result<(), Error> {
        self.records.write().unwrap().push(record);
        Ok(())
    }

    fn find_latest(&self, tree_id: &TreeId) -> Result<Option<SuperblockRecord>, Error> {
        let uuid = tree_id.to_string();
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.uuid == uuid)
            .max_by_key(|r| r.gen)
            .cloned())
    }

    fn find_by_gen(&self, tree_id: &TreeId, gen: u64) -> Result<Option<SuperblockRecord>, Error> {
        let uuid = tree_id.to_string();
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.uuid == uuid && r.gen == gen)
            .cloned())
    }

    fn delete_all(&self, tree_id: &TreeId) -> Result<(), Error> {
        let uuid = tree_id.to_string();
        self.records.write().unwrap().retain(|r| r.uuid != uuid);
        Ok(())
    }
}

/// A file-backed catalog: an append-only log of bincode-framed `SuperblockRecord`s (each frame
/// is a little-endian `u32` length prefix followed by the encoded record), fully indexed into
/// memory on open.
///
/// Unlike the stripe files, `insert` here calls `sync_data` on every write: this is the
/// durability a caller relying on this catalog for publication ordering needs.
pub struct FileCatalog {
    path: PathBuf,
    records: RwLock<Vec<SuperblockRecord>>,
}

impl FileCatalog {
    /// Open (creating if necessary) a catalog log at `path`, replaying any existing records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut cursor = &bytes[..];
        while !cursor.is_empty() {
            if cursor.len() < 4 {
                error!("truncated catalog frame length in {:?}", path);
                break;
            }
            let len = u32::from_le_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
            cursor = &cursor[4..];
            if cursor.len() < len {
                error!("truncated catalog frame body in {:?}", path);
                break;
            }
            let record: SuperblockRecord = bincode::deserialize(&cursor[..len]).map_err(|e| {
                Error::Catalog(format!("corrupt record in {:?}: {}", path, e))
            })?;
            cursor = &cursor[len..];
            records.push(record);
        }

        debug!("loaded {} superblock records from {:?}", records.len(), path);

        Ok(FileCatalog {
            path,
            records: RwLock::new(records),
        })
    }

    fn rewrite(&self, records: &[SuperblockRecord]) -> Result<(), Error> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        for record in records {
            let encoded = bincode::serialize(record)
                .map_err(|e| Error::Catalog(format!("failed to encode record: {}", e)))?;
            file.write_all(&(encoded.len() as u32).to_le_bytes())?;
            file.write_all(&encoded)?;
        }
        file.sync_data()?;
        Ok(())
    }
}

impl SuperblockCatalog for FileCatalog {
    fn insert(&self, record: SuperblockRecord) -> Result<(), Error> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let encoded = bincode::serialize(&record)
            .map_err(|e| Error::Catalog(format!("failed to encode record: {}", e)))?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.sync_data()?;
        self.records.write().unwrap().push(record);
        Ok(())
    }

    fn find_latest(&self, tree_id: &TreeId) -> Result<Option<SuperblockRecord>, Error> {
        let uuid = tree_id.to_string();
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.uuid == uuid)
            .max_by_key(|r| r.gen)
            .cloned())
    }

    fn find_by_gen(&self, tree_id: &TreeId, gen: u64) -> Result<Option<SuperblockRecord>, Error> {
        let uuid = tree_id.to_string();
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.uuid == uuid && r.gen == gen)
            .cloned())
    }

    fn delete_all(&self, tree_id: &TreeId) -> Result<(), Error> {
        let uuid = tree_id.to_string();
        let remaining: Vec<_> = self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.uuid != uuid)
            .cloned()
            .collect();
        self.rewrite(&remaining)?;
        *self.records.write().unwrap() = remaining;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tstree_blockstore_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.catalog", name));
        std::fs::remove_file(&path).unwrap_or_default();
        path
    }

    #[test]
    fn memory_catalog_find_latest() {
        let catalog = MemoryCatalog::new();
        let t1 = TreeId::new("t1");
        catalog
            .insert(SuperblockRecord {
                uuid: t1.to_string(),
                gen: 1,
                root: 100,
            })
            .unwrap();
        catalog
            .insert(SuperblockRecord {
                uuid: t1.to_string(),
                gen: 2,
                root: 200,
            })
            .unwrap();

        let latest = load(&catalog, &t1, LATEST).unwrap().unwrap();
        assert_eq!(latest.gen(), 2);
        assert_eq!(latest.root(), 200);

        let g1 = load(&catalog, &t1, 1).unwrap().unwrap();
        assert_eq!(g1.root(), 100);
    }

    #[test]
    fn memory_catalog_missing_tree_is_none() {
        let catalog = MemoryCatalog::new();
        let t1 = TreeId::new("missing");
        assert!(load(&catalog, &t1, LATEST).unwrap().is_none());
    }

    #[test]
    fn file_catalog_survives_reopen() {
        let path = test_path("file_catalog_survives_reopen");
        let t1 = TreeId::new("reopen-tree");
        {
            let catalog = FileCatalog::open(&path).unwrap();
            catalog
                .insert(SuperblockRecord {
                    uuid: t1.to_string(),
                    gen: 1,
                    root: 42,
                })
                .unwrap();
        }
        let catalog = FileCatalog::open(&path).unwrap();
        let latest = load(&catalog, &t1, LATEST).unwrap().unwrap();
        assert_eq!(latest.root(), 42);
    }

    #[test]
    fn file_catalog_delete_all_removes_tree_only() {
        let path = test_path("file_catalog_delete_all_removes_tree_only");
        let t1 = TreeId::new("doomed");
        let t2 = TreeId::new("survivor");
        let catalog = FileCatalog::open(&path).unwrap();
        catalog
            .insert(SuperblockRecord {
                uuid: t1.to_string(),
                gen: 1,
                root: 1,
            })
            .unwrap();
        catalog
            .insert(SuperblockRecord {
                uuid: t2.to_string(),
                gen: 1,
                root: 2,
            })
            .unwrap();

        catalog.delete_all(&t1).unwrap();

        assert!(load(&catalog, &t1, LATEST).unwrap().is_none());
        assert!(load(&catalog, &t2, LATEST).unwrap().is_some());
    }
}
