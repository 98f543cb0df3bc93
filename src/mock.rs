// TideFS Mock Store — In-memory backing store for testing
//
// Objects live in a sharded-free HashMap of byte vectors. Read and
// allocation failures can be injected to exercise error paths.

use crate::sync::RwLock;
use crate::{BackingStore, FsError, FsResult, ObjectId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, Vec<u8>>>,
    next_id: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_reads: AtomicU32,
    fail_allocs: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_reads: AtomicU32::new(0),
            fail_allocs: AtomicU32::new(0),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Number of record reads served (positional reads included).
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of record writes applied (positional writes included).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make the next read fail with `StorageError`.
    pub fn fail_next_read(&self) {
        self.fail_reads.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next allocation fail with `AllocationError`.
    pub fn fail_next_alloc(&self) {
        self.fail_allocs.fetch_add(1, Ordering::SeqCst);
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemoryStore {
    fn read_record(&self, id: ObjectId) -> FsResult<Vec<u8>> {
        if Self::take_injected(&self.fail_reads) {
            return Err(FsError::StorageError);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.objects
            .read()
            .get(&id)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn write_record(&self, id: ObjectId, bytes: &[u8]) -> FsResult<()> {
        let mut objects = self.objects.write();
        let data = objects.get_mut(&id).ok_or(FsError::NotFound)?;
        data.clear();
        data.extend_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_at(&self, id: ObjectId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        if Self::take_injected(&self.fail_reads) {
            return Err(FsError::StorageError);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.read();
        let data = objects.get(&id).ok_or(FsError::NotFound)?;

        let mut out = vec![0u8; len];
        let start = offset.min(data.len() as u64) as usize;
        let end = (offset + len as u64).min(data.len() as u64) as usize;
        if end > start {
            out[..end - start].copy_from_slice(&data[start..end]);
        }
        Ok(out)
    }

    fn write_at(&self, id: ObjectId, offset: u64, bytes: &[u8]) -> FsResult<()> {
        let mut objects = self.objects.write();
        let data = objects.get_mut(&id).ok_or(FsError::NotFound)?;

        let end = offset as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn allocate_object(&self, _kind_hint: u32, _parent_hint: Option<ObjectId>) -> FsResult<ObjectId> {
        if Self::take_injected(&self.fail_allocs) {
            return Err(FsError::AllocationError);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.objects.write().insert(id, Vec::new());
        Ok(id)
    }

    fn free_object(&self, id: ObjectId) -> FsResult<()> {
        self.objects
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    fn sync(&self) -> FsResult<()> {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_roundtrip() {
        let store = MemoryStore::new();
        let id = store.allocate_object(0, None).expect("alloc");

        store.write_record(id, b"payload").expect("write");
        assert_eq!(store.read_record(id).expect("read"), b"payload");

        store.free_object(id).expect("free");
        assert_eq!(store.read_record(id), Err(FsError::NotFound));
    }

    #[test]
    fn test_positional_io_zero_fills_past_end() {
        let store = MemoryStore::new();
        let id = store.allocate_object(0, None).expect("alloc");

        store.write_at(id, 4, b"abcd").expect("write");
        assert_eq!(store.read_record(id).expect("read").len(), 8);

        let bytes = store.read_at(id, 0, 12).expect("read_at");
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], b"abcd");
        assert_eq!(&bytes[8..], &[0, 0, 0, 0]);

        // Entirely past the end still reads as zeros.
        let tail = store.read_at(id, 100, 4).expect("read_at");
        assert_eq!(tail, vec![0u8; 4]);
    }

    #[test]
    fn test_fault_injection() {
        let store = MemoryStore::new();
        let id = store.allocate_object(0, None).expect("alloc");

        store.fail_next_read();
        assert_eq!(store.read_record(id), Err(FsError::StorageError));
        assert!(store.read_record(id).is_ok());

        store.fail_next_alloc();
        assert_eq!(store.allocate_object(0, None), Err(FsError::AllocationError));
        assert!(store.allocate_object(0, None).is_ok());
    }
}
