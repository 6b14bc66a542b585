//! # Growable Array Integration Tests
//!
//! Exercises the embedded pointer array through the public API: a `Symbol`
//! record type owning a children array with two inline slots, filled with
//! addresses of real records. Covers the documented swap-remove scenario,
//! a randomized add/remove property against a mirror model, and capacity
//! behavior across the inline → block → metablock tiers.

use std::sync::{Arc, OnceLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tagdb::{ChunkCache, Database, FieldArray, StructBuilder, TypeFactory, TypeRegistry};

const SYMBOL_TAG: u16 = 1;

struct SymbolLayout {
    children: FieldArray,
    size: u64,
}

fn layout() -> &'static SymbolLayout {
    static LAYOUT: OnceLock<SymbolLayout> = OnceLock::new();
    LAYOUT.get_or_init(|| {
        let mut b = StructBuilder::new();
        let children = b.add_array(2);
        SymbolLayout {
            children,
            size: b.size(),
        }
    })
}

struct SymbolFactory;
impl TypeFactory for SymbolFactory {
    fn type_name(&self) -> &'static str {
        "Symbol"
    }
    fn record_size(&self) -> u64 {
        layout().size
    }
    fn destruct_fields(&self, db: &Database, address: u64) -> eyre::Result<()> {
        layout().children.destruct(db, address)
    }
}

fn open_db(dir: &tempfile::TempDir) -> Database {
    let mut registry = TypeRegistry::new();
    registry.register(SYMBOL_TAG, Arc::new(SymbolFactory)).unwrap();
    Database::open(
        dir.path().join("index.db"),
        Arc::new(ChunkCache::new()),
        registry,
        1..=1,
        1,
    )
    .unwrap()
}

#[test]
fn swap_remove_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let children = &layout().children;

    let write = db.acquire_write_lock(None).unwrap();
    let owner = db.new_record(SYMBOL_TAG).unwrap();
    let a = db.new_record(SYMBOL_TAG).unwrap();
    let b = db.new_record(SYMBOL_TAG).unwrap();
    let c = db.new_record(SYMBOL_TAG).unwrap();

    assert_eq!(children.add(&db, owner, a).unwrap(), 0);
    assert_eq!(children.add(&db, owner, b).unwrap(), 1);
    // The third add outgrows the two inline slots and forces the first
    // growable block; capacity doubles to fit.
    assert_eq!(children.add(&db, owner, c).unwrap(), 2);
    assert_eq!(children.size(&db, owner).unwrap(), 3);
    assert_eq!(children.capacity(&db, owner).unwrap(), 4);

    let moved = children.remove(&db, owner, 0).unwrap();
    assert_eq!(moved, c, "last element is swapped into the removed slot");
    assert_eq!(children.size(&db, owner).unwrap(), 2);
    assert_eq!(children.get(&db, owner, 0).unwrap(), c);
    assert_eq!(children.get(&db, owner, 1).unwrap(), b);

    write.release(0, false).unwrap();
}

#[test]
fn random_ops_match_mirror_model() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let children = &layout().children;

    let write = db.acquire_write_lock(None).unwrap();
    let owner = db.new_record(SYMBOL_TAG).unwrap();

    // A pool of real records to use as element values (duplicates allowed).
    let pool: Vec<u64> = (0..20).map(|_| db.new_record(SYMBOL_TAG).unwrap()).collect();

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut mirror: Vec<u64> = Vec::new();
    let mut adds = 0u32;
    let mut removes = 0u32;

    for _ in 0..600 {
        if mirror.is_empty() || rng.gen_bool(0.6) {
            let value = pool[rng.gen_range(0..pool.len())];
            let index = children.add(&db, owner, value).unwrap();
            assert_eq!(index as usize, mirror.len());
            mirror.push(value);
            adds += 1;
        } else {
            let index = rng.gen_range(0..mirror.len());
            let moved = children.remove(&db, owner, index as u32).unwrap();
            let last = mirror.len() - 1;
            if index != last {
                assert_eq!(moved, mirror[last]);
                mirror[index] = mirror[last];
            } else {
                assert_eq!(moved, 0);
            }
            mirror.pop();
            removes += 1;
        }

        assert_eq!(children.size(&db, owner).unwrap(), mirror.len() as u32);
        assert_eq!(mirror.len() as u32, adds - removes);
    }

    // The multiset of gettable values equals the mirror, order ignored.
    let mut actual: Vec<u64> = (0..mirror.len())
        .map(|i| children.get(&db, owner, i as u32).unwrap())
        .collect();
    let mut expected = mirror.clone();
    actual.sort_unstable();
    expected.sort_unstable();
    assert_eq!(actual, expected);

    write.release(0, false).unwrap();
}

#[test]
fn capacity_shrinks_to_fresh_computation() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let children = &layout().children;

    let write = db.acquire_write_lock(None).unwrap();
    let owner = db.new_record(SYMBOL_TAG).unwrap();
    let value = db.new_record(SYMBOL_TAG).unwrap();

    // Deep into metablock territory: past inline, past one block, past two.
    let peak = 1400u32;
    for _ in 0..peak {
        children.add(&db, owner, value).unwrap();
    }
    assert!(children.capacity(&db, owner).unwrap() >= peak);

    let final_size = 7u32;
    while children.size(&db, owner).unwrap() > final_size {
        let size = children.size(&db, owner).unwrap();
        children.remove(&db, owner, size - 1).unwrap();
    }

    // A second array grown directly to the final size gives the reference
    // capacity a fresh computation would produce.
    let fresh_owner = db.new_record(SYMBOL_TAG).unwrap();
    children.ensure_capacity(&db, fresh_owner, final_size).unwrap();
    let fresh = children.capacity(&db, fresh_owner).unwrap();

    let shrunk = children.capacity(&db, owner).unwrap();
    assert!(
        shrunk <= fresh,
        "shrunk capacity {shrunk} exceeds fresh capacity {fresh}"
    );

    // Contents survived every repack.
    for i in 0..final_size {
        assert_eq!(children.get(&db, owner, i).unwrap(), value);
    }

    write.release(0, false).unwrap();
}

#[test]
fn metablock_tier_keeps_every_element_addressable() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let children = &layout().children;

    let write = db.acquire_write_lock(None).unwrap();
    let owner = db.new_record(SYMBOL_TAG).unwrap();
    let pool: Vec<u64> = (0..8).map(|_| db.new_record(SYMBOL_TAG).unwrap()).collect();

    let count = 1300u32;
    for i in 0..count {
        children.add(&db, owner, pool[i as usize % pool.len()]).unwrap();
    }

    for i in 0..count {
        assert_eq!(
            children.get(&db, owner, i).unwrap(),
            pool[i as usize % pool.len()]
        );
    }

    write.release(0, false).unwrap();
}

#[test]
fn rejects_zero_and_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let children = &layout().children;

    let write = db.acquire_write_lock(None).unwrap();
    let owner = db.new_record(SYMBOL_TAG).unwrap();

    let err = children.add(&db, owner, 0).unwrap_err();
    assert!(tagdb::StoreError::is_illegal_argument(&err));

    let err = children.get(&db, owner, 0).unwrap_err();
    assert!(tagdb::StoreError::is_illegal_argument(&err));

    write.release(0, false).unwrap();
}

#[test]
fn array_contents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let children = &layout().children;

    let (owner, a, b, c);
    {
        let db = open_db(&dir);
        let write = db.acquire_write_lock(None).unwrap();
        owner = db.new_record(SYMBOL_TAG).unwrap();
        a = db.new_record(SYMBOL_TAG).unwrap();
        b = db.new_record(SYMBOL_TAG).unwrap();
        c = db.new_record(SYMBOL_TAG).unwrap();
        for value in [a, b, c] {
            children.add(&db, owner, value).unwrap();
        }
        db.put_root_ptr(0, owner).unwrap();
        write.release(0, true).unwrap();
    }

    let db = open_db(&dir);
    let _read = db.acquire_read_lock();
    let owner_again = db.root_ptr(0).unwrap();
    assert_eq!(owner_again, owner);
    assert_eq!(children.size(&db, owner_again).unwrap(), 3);
    assert_eq!(children.get(&db, owner_again, 0).unwrap(), a);
    assert_eq!(children.get(&db, owner_again, 1).unwrap(), b);
    assert_eq!(children.get(&db, owner_again, 2).unwrap(), c);
}
