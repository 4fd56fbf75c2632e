#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};
use tstree_blockstore::{BlockStore, MemoryCatalog, TreeId};

fn bench_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir()
        .join("tstree_blockstore_bench")
        .join(name);
    std::fs::remove_dir_all(&dir).unwrap_or_default();
    dir
}

fn allocate_and_commit_one_coreblock(store: &BlockStore, tree: &TreeId) {
    let mut gen = store.obtain_generation(tree.clone()).unwrap();
    let addr = gen.allocate_coreblock().unwrap().this_addr();
    gen.update_root_addr(addr);
    gen.commit().unwrap();
}

fn read_committed_block(store: &BlockStore, addr: tstree_blockstore::Address) {
    black_box(store.read_datablock(addr).unwrap());
}

fn criterion_benchmark(c: &mut Criterion) {
    let store = BlockStore::open(bench_dir("commit"), Box::new(MemoryCatalog::new()), 8).unwrap();
    let tree = TreeId::new("bench-commit");
    c.bench_function("allocate and commit one coreblock", |b| {
        b.iter(|| allocate_and_commit_one_coreblock(&store, &tree))
    });

    let read_store = BlockStore::open(bench_dir("read"), Box::new(MemoryCatalog::new()), 8).unwrap();
    let read_tree = TreeId::new("bench-read");
    let mut gen = read_store.obtain_generation(read_tree).unwrap();
    let addr = gen.allocate_coreblock().unwrap().this_addr();
    gen.update_root_addr(addr);
    gen.commit().unwrap();
    c.bench_function("read a committed coreblock", |b| {
        b.iter(|| read_committed_block(&read_store, addr))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
