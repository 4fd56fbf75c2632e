//! Per-Tree Write-Lock Table
//!
//! Exactly one `Generation` may be in "obtained, not flushed" state per tree at a time. The
//! table maps a tree id to a lock, created on first touch and never removed. Acquiring
//! looks the lock up under a read guard (cheap, concurrent with other lookups) and only takes the
//! write guard to install a brand-new entry -- no blocking operation is ever performed while the
//! table guard itself is held.
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, RwLock},
};

use crate::superblock::TreeId;

/// A lock that can be acquired in one call and released in another, unlike `std::sync::Mutex`
/// whose guard is tied to a lexical scope. The per-tree lock is held from `obtain_generation`'s
/// return through `commit`'s completion -- two separate API calls -- so the table needs a lock
/// primitive that supports that, built from plain `Mutex`/`Condvar` rather than pulling in a new
/// dependency.
struct RawLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl RawLock {
    fn new() -> Self {
        RawLock {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn lock(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.released.wait(held).unwrap();
        }
        *held = true;
    }

    fn unlock(&self) {
        let mut held = self.held.lock().unwrap();
        *held = false;
        self.released.notify_one();
    }
}

/// A table of per-tree locks. Entries live for the lifetime of the table; shrinking it is
/// out of scope.
#[derive(Default)]
pub struct LockTable {
    locks: RwLock<HashMap<TreeId, Arc<RawLock>>>,
}

impl LockTable {
    /// An empty table.
    pub fn new() -> Self {
        LockTable {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire (blocking) the lock for `tree_id`, creating its entry on first use.
    ///
    /// Returns a guard that releases the per-tree lock, and only the per-tree lock, on drop --
    /// the caller may continue to block on I/O without holding the table's own guard at any
    /// point beyond this function's lookup/insert.
    pub fn acquire(&self, tree_id: &TreeId) -> TreeLockGuard {
        let existing = {
            let locks = self.locks.read().unwrap();
            locks.get(tree_id).cloned()
        };

        let lock = match existing {
            Some(lock) => lock,
            None => {
                let mut locks = self.locks.write().unwrap();
                locks
                    .entry(tree_id.clone())
                    .or_insert_with(|| Arc::new(RawLock::new()))
                    .clone()
            }
        };

        lock.lock();
        TreeLockGuard { lock }
    }
}

/// Holds a tree's write lock until dropped. Modeled as an owned guard (rather than borrowing
/// `LockTable`) so a `Generation` can carry it across its whole obtain-to-commit lifetime without
/// tying its lifetime to the table's.
pub struct TreeLockGuard {
    lock: Arc<RawLock>,
}

impl Drop for TreeLockGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn same_tree_serializes() {
        let table = Arc::new(LockTable::new());
        let id = TreeId::new("serial-tree");

        let guard = table.acquire(&id);

        let table2 = table.clone();
        let id2 = id.clone();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _guard2 = table2.acquire(&id2);
            tx.send(()).unwrap();
        });

        // the second acquire should not complete while we hold the first guard.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn different_trees_do_not_block() {
        let table = LockTable::new();
        let a = TreeId::new("a");
        let b = TreeId::new("b");

        let _g1 = table.acquire(&a);
        // must not block: distinct tree.
        let _g2 = table.acquire(&b);
    }
}
