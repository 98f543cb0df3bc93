// TideFS Object Cache — singleton in-memory handles over backing-store objects
//
// Maps each object id to at most one live `ObjectHandle`. Callers hold
// counted references; the cache owns handle existence. A handle whose last
// reference drops stays cached "warm" (backing hold released) unless the
// object was unlinked, in which case it is reclaimed immediately.
//
// Lock order: id hold lock -> identity-map shard -> handle state.

use crate::shard::{IdLocks, ShardedMap, DEFAULT_SHARDS};
use crate::sync::Mutex;
use crate::{BackingStore, FsError, FsResult, ObjectId};
use std::sync::Arc;

/// Object record magic: "TDOB"
pub const OBJECT_MAGIC: u32 = 0x5444_4F42;
/// Serialized size of an object record
pub const OBJECT_RECORD_SIZE: usize = 40;

// ============================================================================
// OBJECT ATTRIBUTES
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl ObjectKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ObjectKind::File),
            2 => Some(ObjectKind::Directory),
            3 => Some(ObjectKind::Symlink),
            _ => None,
        }
    }
}

/// Durable fields of an object, cached in memory while the handle lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub kind: ObjectKind,
    pub uid: u32,
    pub gid: u32,
    pub links: u32,
    pub size: u64,
    pub generation: u64,
}

impl ObjectAttrs {
    pub fn new(kind: ObjectKind, uid: u32, gid: u32) -> Self {
        Self {
            kind,
            uid,
            gid,
            links: 1,
            size: 0,
            generation: 0,
        }
    }

    /// Serialize to the fixed on-store record layout.
    pub fn serialize(&self) -> [u8; OBJECT_RECORD_SIZE] {
        let mut buf = [0u8; OBJECT_RECORD_SIZE];
        buf[0..4].copy_from_slice(&OBJECT_MAGIC.to_le_bytes());
        buf[4] = self.kind as u8;
        // bytes 5..8 reserved
        buf[8..12].copy_from_slice(&self.uid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.gid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.links.to_le_bytes());
        buf[20..28].copy_from_slice(&self.size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    /// Deserialize, validating magic and type signature.
    pub fn deserialize(buf: &[u8]) -> FsResult<Self> {
        if buf.len() < OBJECT_RECORD_SIZE {
            return Err(FsError::InvalidRecord);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != OBJECT_MAGIC {
            return Err(FsError::InvalidRecord);
        }
        let kind = ObjectKind::from_u8(buf[4]).ok_or(FsError::InvalidRecord)?;
        Ok(Self {
            kind,
            uid: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            gid: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            links: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            size: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            generation: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
        })
    }
}

// ============================================================================
// OBJECT HANDLE
// ============================================================================

bitflags::bitflags! {
    /// In-memory fields not yet flushed to the backing store.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DirtyFields: u32 {
        const SIZE  = 0x01;
        const OWNER = 0x02;
        const LINKS = 0x04;
    }
}

struct HandleState {
    refs: u32,
    held: bool,
    unlinked: bool,
    /// Set when the cache has discarded this handle; a racing fast-path
    /// lookup must not revive it.
    defunct: bool,
    dirty: DirtyFields,
    attrs: ObjectAttrs,
}

/// One backing-store object materialized in memory. The cache hands out
/// counted references to a shared handle; callers must pair every `lookup`/
/// `create` with a `release`.
pub struct ObjectHandle {
    object_id: ObjectId,
    state: Mutex<HandleState>,
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("object_id", &self.object_id)
            .finish_non_exhaustive()
    }
}

/// Handles are singletons per id, so identity is the object id.
impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.object_id == other.object_id
    }
}

impl Eq for ObjectHandle {}

impl ObjectHandle {
    fn new(object_id: ObjectId, attrs: ObjectAttrs) -> Self {
        Self {
            object_id,
            state: Mutex::new(HandleState {
                refs: 1,
                held: true,
                unlinked: false,
                defunct: false,
                dirty: DirtyFields::empty(),
                attrs,
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.object_id
    }

    /// Copy of the current attributes.
    pub fn attrs(&self) -> ObjectAttrs {
        self.state.lock().attrs
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().refs
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub fn is_unlinked(&self) -> bool {
        self.state.lock().unlinked
    }

    pub fn dirty_fields(&self) -> DirtyFields {
        self.state.lock().dirty
    }

    /// Update the object size, marking the field dirty.
    pub fn set_size(&self, size: u64) {
        let mut st = self.state.lock();
        st.attrs.size = size;
        st.dirty |= DirtyFields::SIZE;
    }

    /// Update ownership, marking the field dirty.
    pub fn set_owner(&self, uid: u32, gid: u32) {
        let mut st = self.state.lock();
        st.attrs.uid = uid;
        st.attrs.gid = gid;
        st.dirty |= DirtyFields::OWNER;
    }

    /// Update the durable link count, marking the field dirty.
    pub fn set_links(&self, links: u32) {
        let mut st = self.state.lock();
        st.attrs.links = links;
        st.dirty |= DirtyFields::LINKS;
    }
}

// ============================================================================
// OBJECT CACHE
// ============================================================================

pub struct ObjectCache<S: BackingStore> {
    store: Arc<S>,
    /// Identity map: presence is not a reference.
    handles: ShardedMap<Arc<ObjectHandle>>,
    /// Per-id materialize/reclaim locks, held across backing-store reads so
    /// concurrent lookups for one unresolved id block instead of racing.
    hold_locks: IdLocks,
}

impl<S: BackingStore> ObjectCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            handles: ShardedMap::new(DEFAULT_SHARDS),
            hold_locks: IdLocks::new(DEFAULT_SHARDS),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of handles currently cached (referenced or warm).
    pub fn cached_handles(&self) -> usize {
        self.handles.len()
    }

    /// Allocate a new backing object and materialize its handle with one
    /// reference. The durable record is committed before the handle becomes
    /// visible; allocation failure leaves no trace.
    pub fn create(
        &self,
        parent_hint: Option<ObjectId>,
        attrs: ObjectAttrs,
    ) -> FsResult<Arc<ObjectHandle>> {
        let id = self
            .store
            .allocate_object(attrs.kind as u32, parent_hint)?;

        let mut tx = self.store.begin_transaction();
        tx.free_on_abort(id);
        tx.write_record(id, &attrs.serialize());
        tx.commit()?;

        let _hold = self.hold_locks.lock(id);
        let handle = Arc::new(ObjectHandle::new(id, attrs));
        let prev = self.handles.insert(id, handle.clone());
        debug_assert!(prev.is_none(), "fresh id {} already cached", id);
        log::debug!("created object {}", id);
        Ok(handle)
    }

    /// Look up an object by id, taking a reference. Warm handles are reused
    /// without a storage read; otherwise exactly one caller materializes the
    /// handle while the rest wait on the id's hold lock.
    pub fn lookup(&self, id: ObjectId) -> FsResult<Arc<ObjectHandle>> {
        // Fast path: already cached.
        if let Some(handle) = self.handles.get(id) {
            if let Some(h) = Self::try_reference(handle)? {
                return Ok(h);
            }
        }

        // Slow path: serialize materialization per id.
        let _hold = self.hold_locks.lock(id);
        if let Some(handle) = self.handles.get(id) {
            if let Some(h) = Self::try_reference(handle)? {
                return Ok(h);
            }
        }

        let bytes = self.store.read_record(id)?;
        let attrs = ObjectAttrs::deserialize(&bytes)?;
        let handle = Arc::new(ObjectHandle::new(id, attrs));
        self.handles.insert(id, handle.clone());
        log::debug!("materialized object {}", id);
        Ok(handle)
    }

    /// Take a reference on an existing handle, re-acquiring the backing hold
    /// for warm handles. Returns Ok(None) if the handle was discarded between
    /// the map read and the state lock (caller retries on the slow path).
    fn try_reference(handle: Arc<ObjectHandle>) -> FsResult<Option<Arc<ObjectHandle>>> {
        let mut st = handle.state.lock();
        if st.unlinked {
            // Pending reclamation; by contract lookups never see it.
            return Err(FsError::NotFound);
        }
        if st.defunct {
            return Ok(None);
        }
        st.refs += 1;
        st.held = true;
        drop(st);
        Ok(Some(handle))
    }

    /// Drop one reference. On the last release the object is either
    /// reclaimed (if unlinked) or flushed and parked warm in the cache.
    pub fn release(&self, handle: &Arc<ObjectHandle>) -> FsResult<()> {
        {
            let mut st = handle.state.lock();
            debug_assert!(st.refs > 0, "release without reference");
            if st.refs > 1 {
                st.refs -= 1;
                return Ok(());
            }
        }

        // Possibly the last reference: retake locks in hold->state order so
        // reclamation serializes with concurrent materialization.
        let id = handle.object_id;
        let _hold = self.hold_locks.lock(id);
        let mut st = handle.state.lock();
        st.refs -= 1;
        if st.refs > 0 {
            // A lookup slipped in while we reordered locks.
            return Ok(());
        }

        if st.unlinked {
            st.held = false;
            st.defunct = true;
            drop(st);
            self.handles.remove(id);
            self.store.free_object(id)?;
            log::debug!("reclaimed unlinked object {}", id);
            return Ok(());
        }

        // Still linked: flush pending fields, release the hold, keep warm.
        if !st.dirty.is_empty() {
            self.store.write_record(id, &st.attrs.serialize())?;
            st.dirty = DirtyFields::empty();
        }
        st.held = false;
        Ok(())
    }

    /// Mark an object as having zero durable links. Reclamation is deferred
    /// to the release that drops the last reference.
    pub fn mark_unlinked(&self, handle: &Arc<ObjectHandle>) {
        let mut st = handle.state.lock();
        st.unlinked = true;
        st.attrs.links = 0;
        log::debug!("object {} marked unlinked", handle.object_id);
    }

    /// Flush dirty fields of a referenced handle without releasing it.
    pub fn sync_object(&self, handle: &Arc<ObjectHandle>) -> FsResult<()> {
        let mut st = handle.state.lock();
        if st.dirty.is_empty() {
            return Ok(());
        }
        self.store.write_record(handle.object_id, &st.attrs.serialize())?;
        st.dirty = DirtyFields::empty();
        Ok(())
    }

    /// Drop warm, unreferenced handles. Memory-pressure policy lives with
    /// the caller; this is just the eviction entry point. Returns the number
    /// of handles evicted.
    pub fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for id in self.handles.keys() {
            let _hold = self.hold_locks.lock(id);
            let Some(handle) = self.handles.get(id) else {
                continue;
            };
            let mut st = handle.state.lock();
            if st.refs == 0 && !st.held {
                st.defunct = true;
                drop(st);
                self.handles.remove(id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::debug!("evicted {} idle object handles", evicted);
        }
        evicted
    }
}

// ============================================================================
// TESTS
// ============================================================================
