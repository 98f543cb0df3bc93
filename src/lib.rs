// TideFS Core — Object lifecycle and quota accounting
// Identity cache with reference-counted handles over backing-store objects,
// plus a per-identity quota ledger with soft/hard limits and grace timers.

pub mod cache;
pub mod local;
pub mod mock;
pub mod quota;
pub mod shard;
pub mod sync;
pub mod time;

pub use cache::{ObjectAttrs, ObjectCache, ObjectHandle, ObjectKind};
pub use local::FileStore;
pub use mock::MemoryStore;
pub use quota::{ChargeOpts, QuotaKind, QuotaLedger, QuotaLimits, QuotaSnapshot};
pub use time::Clock;

/// Stable numeric identifier of a backing-store object.
pub type ObjectId = u64;

// ============================================================================
// ERROR TYPES
// ============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// Object or record absent; caller decides whether to create.
    #[error("object or record not found")]
    NotFound,
    /// Stored bytes do not match the expected record shape.
    #[error("stored record shape mismatch")]
    InvalidRecord,
    /// Backing store read/write failed.
    #[error("backing store I/O error")]
    StorageError,
    /// Backing store could not allocate a new object.
    #[error("backing store allocation failed")]
    AllocationError,
    /// Caller lacks the required capability.
    #[error("permission denied")]
    PermissionDenied,
    /// Charge would meet or exceed a hard quota limit.
    #[error("hard quota limit exceeded")]
    HardLimitExceeded,
    /// Charge while over the soft limit and past the grace deadline.
    #[error("quota grace period expired")]
    GraceExpired,
    /// Quota kind is mid enable/disable; retry later.
    #[error("quota kind state transition in progress")]
    Busy,
    /// Operation requires quota accounting to be on for this kind.
    #[error("quota accounting is off")]
    QuotaOff,
}

/// Crate-wide operation result.
pub type FsResult<T> = Result<T, FsError>;

// ============================================================================
// CREDENTIALS
// ============================================================================

bitflags::bitflags! {
    /// Capabilities re-validated on every administrative call.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// May enable/disable quotas, set limits/usage, and bypass limit checks.
        const QUOTA_ADMIN = 0x0001;
        /// May query any identity's quota record.
        const QUOTA_VIEW_ANY = 0x0002;
    }
}

/// Caller identity presented to quota operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub caps: Capabilities,
}

impl Credential {
    /// Unprivileged credential.
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            caps: Capabilities::empty(),
        }
    }

    /// Administrative credential.
    pub fn admin(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            caps: Capabilities::QUOTA_ADMIN | Capabilities::QUOTA_VIEW_ANY,
        }
    }

    pub fn is_quota_admin(&self) -> bool {
        self.caps.contains(Capabilities::QUOTA_ADMIN)
    }

    pub fn may_view_any(&self) -> bool {
        self.caps.contains(Capabilities::QUOTA_VIEW_ANY)
    }
}

// ============================================================================
// BACKING STORE
// ============================================================================

/// Durable storage collaborator. Implementations serialize concurrent access
/// to the same object internally; callers must still avoid issuing two
/// concurrent writes for the same record (the per-record locks do).
pub trait BackingStore: Send + Sync {
    /// Read the full byte image of an object.
    fn read_record(&self, id: ObjectId) -> FsResult<Vec<u8>>;

    /// Replace the full byte image of an object.
    fn write_record(&self, id: ObjectId, bytes: &[u8]) -> FsResult<()>;

    /// Positional read. Ranges beyond the current object length read as
    /// zeros; only a missing object is `NotFound`.
    fn read_at(&self, id: ObjectId, offset: u64, len: usize) -> FsResult<Vec<u8>>;

    /// Positional write, extending the object with zeros as needed.
    fn write_at(&self, id: ObjectId, offset: u64, bytes: &[u8]) -> FsResult<()>;

    /// Allocate a fresh object id. `kind_hint` and `parent_hint` let the
    /// store place related objects near each other; stores may ignore them.
    fn allocate_object(&self, kind_hint: u32, parent_hint: Option<ObjectId>) -> FsResult<ObjectId>;

    /// Release an object and its bytes.
    fn free_object(&self, id: ObjectId) -> FsResult<()>;

    /// Flush any buffered writes to durable media.
    fn sync(&self) -> FsResult<()>;

    /// Start a transaction that buffers writes until commit.
    fn begin_transaction(&self) -> StoreTx<'_>
    where
        Self: Sized,
    {
        StoreTx::new(self)
    }
}

enum TxWrite {
    Record { id: ObjectId, bytes: Vec<u8> },
    At { id: ObjectId, offset: u64, bytes: Vec<u8> },
}

/// Buffered multi-write transaction. Writes are applied in order on commit,
/// followed by a store sync; on abort (explicit or by drop) nothing is
/// applied and objects registered via `free_on_abort` are released.
pub struct StoreTx<'a> {
    store: &'a dyn BackingStore,
    writes: Vec<TxWrite>,
    pending_frees: Vec<ObjectId>,
    done: bool,
}

impl<'a> StoreTx<'a> {
    fn new(store: &'a dyn BackingStore) -> Self {
        Self {
            store,
            writes: Vec::new(),
            pending_frees: Vec::new(),
            done: false,
        }
    }

    pub fn write_record(&mut self, id: ObjectId, bytes: &[u8]) {
        self.writes.push(TxWrite::Record {
            id,
            bytes: bytes.to_vec(),
        });
    }

    pub fn write_at(&mut self, id: ObjectId, offset: u64, bytes: &[u8]) {
        self.writes.push(TxWrite::At {
            id,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    /// Register an object allocated inside this transaction; it is freed if
    /// the transaction does not commit.
    pub fn free_on_abort(&mut self, id: ObjectId) {
        self.pending_frees.push(id);
    }

    pub fn commit(mut self) -> FsResult<()> {
        let result = self.apply();
        if result.is_err() {
            self.release_pending();
        }
        self.done = true;
        result
    }

    pub fn abort(mut self) {
        self.release_pending();
        self.done = true;
    }

    fn apply(&mut self) -> FsResult<()> {
        for write in self.writes.drain(..) {
            match write {
                TxWrite::Record { id, bytes } => self.store.write_record(id, &bytes)?,
                TxWrite::At { id, offset, bytes } => self.store.write_at(id, offset, &bytes)?,
            }
        }
        self.store.sync()
    }

    fn release_pending(&mut self) {
        for id in self.pending_frees.drain(..) {
            if self.store.free_object(id).is_err() {
                log::warn!("transaction rollback could not free object {}", id);
            }
        }
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.release_pending();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
