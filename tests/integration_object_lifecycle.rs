use std::sync::Arc;
use tidefs::cache::{ObjectAttrs, ObjectCache, ObjectKind};
use tidefs::local::FileStore;
use tidefs::{BackingStore, FsError};

fn file_attrs(uid: u32) -> ObjectAttrs {
    ObjectAttrs::new(ObjectKind::File, uid, 100)
}

#[test]
fn object_attributes_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    let id = {
        let store = Arc::new(FileStore::open(dir.path()).expect("open"));
        let cache = ObjectCache::new(store);

        let h = cache.create(None, file_attrs(1000)).expect("create");
        h.set_size(4096);
        h.set_owner(1000, 200);
        let id = h.id();
        // Last release flushes the dirty fields before parking the handle.
        cache.release(&h).expect("release");
        id
    };

    let store = Arc::new(FileStore::open(dir.path()).expect("reopen"));
    let cache = ObjectCache::new(store);

    let h = cache.lookup(id).expect("lookup after reopen");
    let attrs = h.attrs();
    assert_eq!(attrs.size, 4096);
    assert_eq!(attrs.uid, 1000);
    assert_eq!(attrs.gid, 200);
    cache.release(&h).expect("release");
}

#[test]
fn unlink_reclaims_backing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileStore::open(dir.path()).expect("open"));
    let cache = ObjectCache::new(store);

    let h = cache.create(None, file_attrs(1000)).expect("create");
    let id = h.id();
    let second = cache.lookup(id).expect("second ref");

    cache.mark_unlinked(&h);
    cache.release(&second).expect("release second");

    // Still referenced, so the backing file must still exist.
    assert!(cache.store().read_record(id).is_ok());

    cache.release(&h).expect("final release");
    assert_eq!(cache.store().read_record(id), Err(FsError::NotFound));
    assert_eq!(cache.lookup(id), Err(FsError::NotFound));
}

#[test]
fn concurrent_lookups_share_one_handle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileStore::open(dir.path()).expect("open"));
    let cache = Arc::new(ObjectCache::new(store));

    let h = cache.create(None, file_attrs(1000)).expect("create");
    let id = h.id();
    cache.release(&h).expect("release");
    drop(h);

    let mut threads = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        threads.push(std::thread::spawn(move || {
            let h = cache.lookup(id).expect("lookup");
            let got = h.id();
            cache.release(&h).expect("release");
            got
        }));
    }
    for t in threads {
        assert_eq!(t.join().unwrap(), id);
    }

    // Everyone is done; exactly one warm handle remains cached.
    assert_eq!(cache.cached_handles(), 1);
    assert_eq!(cache.evict_idle(), 1);
    assert_eq!(cache.cached_handles(), 0);
}
