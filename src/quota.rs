// TideFS Quota Ledger — per-identity resource accounting with grace timers
//
// Tracks primary (block) and secondary (object) usage per (kind, identity)
// pair against soft/hard limits. Records load lazily from a flat backing
// object — record_offset(identity) = identity * QUOTA_RECORD_SIZE — and are
// flushed on sync or disable. Each quota kind cycles through
// Disabled -> Enabling -> Enabled -> Disabling -> Disabled; the transient
// states keep charges from observing half-built kind state.

use crate::shard::{ShardedMap, DEFAULT_SHARDS};
use crate::sync::{Mutex, RwLock};
use crate::time::{Clock, SystemClock};
use crate::{BackingStore, Credential, FsError, FsResult, ObjectId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default grace period: 7 days in nanoseconds
pub const DEFAULT_GRACE_PERIOD: u64 = 7 * 24 * 60 * 60 * 1_000_000_000;

/// Serialized size of one quota record; the backing object is a flat,
/// directly seekable array of these.
pub const QUOTA_RECORD_SIZE: usize = 64;

// ============================================================================
// KINDS AND LIMITS
// ============================================================================

/// Accounting dimension: by owning user or by owning group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    User,
    Group,
}

impl QuotaKind {
    pub const ALL: [QuotaKind; 2] = [QuotaKind::User, QuotaKind::Group];
    pub(crate) const COUNT: usize = 2;

    fn index(self) -> usize {
        match self {
            QuotaKind::User => 0,
            QuotaKind::Group => 1,
        }
    }
}

/// Soft/hard limits for both resources. Zero means "no limit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub soft_primary: u64,
    pub hard_primary: u64,
    pub soft_secondary: u64,
    pub hard_secondary: u64,
}

impl QuotaLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// True when no limit is set for either resource.
    pub fn is_unlimited(&self) -> bool {
        self.soft_primary == 0
            && self.hard_primary == 0
            && self.soft_secondary == 0
            && self.hard_secondary == 0
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct QuotaFlags: u32 {
        /// Rejection already logged for the current primary violation episode.
        const OVER_PRIMARY_WARNED = 0x01;
        /// Rejection already logged for the current secondary violation episode.
        const OVER_SECONDARY_WARNED = 0x02;
        /// In-memory state differs from the backing record.
        const DIRTY = 0x04;
        /// No limits set; record exists only to track usage.
        const FAKE = 0x08;
    }
}

// ============================================================================
// QUOTA RECORD
// ============================================================================

struct RecordInner {
    used_primary: u64,
    used_secondary: u64,
    limits: QuotaLimits,
    /// Grace deadlines in ns since epoch; 0 = unset.
    grace_primary: u64,
    grace_secondary: u64,
    flags: QuotaFlags,
}

impl RecordInner {
    fn serialize(&self) -> [u8; QUOTA_RECORD_SIZE] {
        let mut buf = [0u8; QUOTA_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.used_primary.to_le_bytes());
        buf[8..16].copy_from_slice(&self.used_secondary.to_le_bytes());
        buf[16..24].copy_from_slice(&self.limits.soft_primary.to_le_bytes());
        buf[24..32].copy_from_slice(&self.limits.hard_primary.to_le_bytes());
        buf[32..40].copy_from_slice(&self.limits.soft_secondary.to_le_bytes());
        buf[40..48].copy_from_slice(&self.limits.hard_secondary.to_le_bytes());
        buf[48..56].copy_from_slice(&self.grace_primary.to_le_bytes());
        buf[56..64].copy_from_slice(&self.grace_secondary.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8]) -> Self {
        let limits = QuotaLimits {
            soft_primary: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            hard_primary: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            soft_secondary: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            hard_secondary: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        };
        let mut flags = QuotaFlags::empty();
        if limits.is_unlimited() {
            flags |= QuotaFlags::FAKE;
        }
        Self {
            used_primary: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            used_secondary: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            limits,
            grace_primary: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            grace_secondary: u64::from_le_bytes(buf[56..64].try_into().unwrap()),
            flags,
        }
    }
}

/// One (kind, identity) usage record. The inner mutex is held across flush
/// I/O so a reader never observes a torn in-flight state.
pub struct QuotaRecord {
    identity: u64,
    kind: QuotaKind,
    inner: Mutex<RecordInner>,
}

impl QuotaRecord {
    fn from_disk(identity: u64, kind: QuotaKind, bytes: &[u8]) -> Self {
        Self {
            identity,
            kind,
            inner: Mutex::new(RecordInner::deserialize(bytes)),
        }
    }
}

/// Read-only copy of a record's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub identity: u64,
    pub kind: QuotaKind,
    pub used_primary: u64,
    pub used_secondary: u64,
    pub limits: QuotaLimits,
    pub grace_deadline_primary: u64,
    pub grace_deadline_secondary: u64,
}

impl QuotaSnapshot {
    pub fn over_soft_primary(&self) -> bool {
        self.limits.soft_primary != 0 && self.used_primary > self.limits.soft_primary
    }

    pub fn over_soft_secondary(&self) -> bool {
        self.limits.soft_secondary != 0 && self.used_secondary > self.limits.soft_secondary
    }
}

// ============================================================================
// KIND STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindStatus {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

struct KindState {
    status: KindStatus,
    backing: Option<ObjectId>,
    grace_period_primary: u64,
    grace_period_secondary: u64,
    /// Identity of the administrator who enabled enforcement.
    enabled_by: u32,
    records: ShardedMap<Arc<QuotaRecord>>,
}

impl KindState {
    fn new() -> Self {
        Self {
            status: KindStatus::Disabled,
            backing: None,
            grace_period_primary: DEFAULT_GRACE_PERIOD,
            grace_period_secondary: DEFAULT_GRACE_PERIOD,
            enabled_by: 0,
            records: ShardedMap::new(DEFAULT_SHARDS),
        }
    }

    fn clear(&mut self) {
        self.status = KindStatus::Disabled;
        self.backing = None;
        self.grace_period_primary = DEFAULT_GRACE_PERIOD;
        self.grace_period_secondary = DEFAULT_GRACE_PERIOD;
        self.enabled_by = 0;
        self.records.clear();
    }
}

// ============================================================================
// CHARGE OPTIONS
// ============================================================================

/// Options for `charge`.
#[derive(Debug, Clone, Copy)]
pub struct ChargeOpts {
    /// Bypass limit checks; used for non-primary-owner adjustments such as
    /// moving usage during an ownership change.
    pub force: bool,
    /// Authorizing credential; quota administrators are never limited.
    pub cred: Credential,
}

impl ChargeOpts {
    pub fn new(cred: Credential) -> Self {
        Self { force: false, cred }
    }

    pub fn forced(cred: Credential) -> Self {
        Self { force: true, cred }
    }
}

// ============================================================================
// QUOTA LEDGER
// ============================================================================

pub struct QuotaLedger<S: BackingStore, C: Clock = SystemClock> {
    store: Arc<S>,
    clock: C,
    kinds: [RwLock<KindState>; QuotaKind::COUNT],
    /// When set, `query` is open to any caller for any identity.
    unrestricted_view: AtomicBool,
}

impl<S: BackingStore> QuotaLedger<S, SystemClock> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, SystemClock::new())
    }
}

impl<S: BackingStore, C: Clock> QuotaLedger<S, C> {
    pub fn with_clock(store: Arc<S>, clock: C) -> Self {
        Self {
            store,
            clock,
            kinds: [RwLock::new(KindState::new()), RwLock::new(KindState::new())],
            unrestricted_view: AtomicBool::new(false),
        }
    }

    fn kind(&self, kind: QuotaKind) -> &RwLock<KindState> {
        &self.kinds[kind.index()]
    }

    pub fn status(&self, kind: QuotaKind) -> KindStatus {
        self.kind(kind).read().status
    }

    /// Grace periods (primary, secondary) currently in force for a kind.
    pub fn grace_periods(&self, kind: QuotaKind) -> (u64, u64) {
        let st = self.kind(kind).read();
        (st.grace_period_primary, st.grace_period_secondary)
    }

    /// Toggle whether unprivileged callers may query any identity.
    pub fn set_unrestricted_view(&self, allow: bool) {
        self.unrestricted_view.store(allow, Ordering::SeqCst);
    }

    fn require_admin(cred: &Credential) -> FsResult<()> {
        // Capability is revalidated on every administrative call.
        if cred.is_quota_admin() {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    fn require_enabled(st: &KindState) -> FsResult<ObjectId> {
        match st.status {
            KindStatus::Enabled => st.backing.ok_or(FsError::QuotaOff),
            KindStatus::Enabling | KindStatus::Disabling => Err(FsError::Busy),
            KindStatus::Disabled => Err(FsError::QuotaOff),
        }
    }

    // ------------------------------------------------------------------
    // enable / disable
    // ------------------------------------------------------------------

    /// Turn accounting on for a kind. `backing_object` holds the flat record
    /// array; grace periods come from its identity-0 record. Records for
    /// `open_identities` (owners of currently-open objects) are attached
    /// eagerly so in-flight writes are charged from the moment enforcement
    /// starts; any attach failure rolls the whole enable back.
    pub fn enable(
        &self,
        kind: QuotaKind,
        backing_object: ObjectId,
        open_identities: &[u64],
        cred: &Credential,
    ) -> FsResult<()> {
        Self::require_admin(cred)?;

        {
            let mut st = self.kind(kind).write();
            if st.status != KindStatus::Disabled {
                return Err(FsError::Busy);
            }
            st.status = KindStatus::Enabling;
        }

        let loaded = self.load_kind(kind, backing_object, open_identities);

        let mut st = self.kind(kind).write();
        match loaded {
            Ok((grace_primary, grace_secondary, records)) => {
                st.status = KindStatus::Enabled;
                st.backing = Some(backing_object);
                st.grace_period_primary = grace_primary;
                st.grace_period_secondary = grace_secondary;
                st.enabled_by = cred.uid;
                st.records = records;
                log::info!("{:?} quota enabled by uid {}", kind, cred.uid);
                Ok(())
            }
            Err(e) => {
                st.clear();
                log::warn!("{:?} quota enable rolled back: {}", kind, e);
                Err(e)
            }
        }
    }

    fn load_kind(
        &self,
        kind: QuotaKind,
        backing: ObjectId,
        open_identities: &[u64],
    ) -> FsResult<(u64, u64, ShardedMap<Arc<QuotaRecord>>)> {
        // Validate the backing object's shape before trusting any record.
        let image = self.store.read_record(backing)?;
        if image.len() % QUOTA_RECORD_SIZE != 0 {
            return Err(FsError::InvalidRecord);
        }

        // The identity-0 record carries the kind's grace periods in its
        // deadline slots; zero falls back to the defaults.
        let zero = self.read_backing_record(backing, 0, kind)?;
        let zero_inner = zero.inner.lock();
        let grace_primary = match zero_inner.grace_primary {
            0 => DEFAULT_GRACE_PERIOD,
            ns => ns,
        };
        let grace_secondary = match zero_inner.grace_secondary {
            0 => DEFAULT_GRACE_PERIOD,
            ns => ns,
        };
        drop(zero_inner);

        let records = ShardedMap::new(DEFAULT_SHARDS);
        for &identity in open_identities {
            if identity == 0 {
                continue;
            }
            let rec = self.read_backing_record(backing, identity, kind)?;
            records.insert(identity, Arc::new(rec));
        }
        Ok((grace_primary, grace_secondary, records))
    }

    /// Turn accounting off: flush dirty records, drop them, close the
    /// backing object. Returns the first flush error, but always finishes
    /// the teardown.
    pub fn disable(&self, kind: QuotaKind, cred: &Credential) -> FsResult<()> {
        Self::require_admin(cred)?;

        let (backing, records) = {
            let mut st = self.kind(kind).write();
            match st.status {
                KindStatus::Enabled => {}
                KindStatus::Disabled => return Err(FsError::QuotaOff),
                _ => return Err(FsError::Busy),
            }
            st.status = KindStatus::Disabling;
            let records =
                std::mem::replace(&mut st.records, ShardedMap::new(DEFAULT_SHARDS));
            (st.backing, records)
        };

        let mut first_err = None;
        if let Some(backing) = backing {
            for rec in records.values() {
                if let Err(e) = self.flush_record(backing, &rec) {
                    log::warn!(
                        "{:?} quota record {} not flushed on disable: {}",
                        kind,
                        rec.identity,
                        e
                    );
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = self.store.sync() {
                first_err.get_or_insert(e);
            }
        }

        let mut st = self.kind(kind).write();
        st.clear();
        log::info!("{:?} quota disabled by uid {}", kind, cred.uid);
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // charge / query
    // ------------------------------------------------------------------

    /// Apply a usage delta. Negative deltas (releases) always succeed and
    /// clamp at zero. Positive deltas are checked against the hard limit,
    /// then the soft limit with its grace window, unless forced or issued
    /// by a quota administrator. A rejection leaves usage untouched.
    pub fn charge(
        &self,
        identity: u64,
        kind: QuotaKind,
        primary_delta: i64,
        secondary_delta: i64,
        opts: &ChargeOpts,
    ) -> FsResult<()> {
        if primary_delta == 0 && secondary_delta == 0 {
            return Ok(());
        }

        let st = self.kind(kind).read();
        match st.status {
            KindStatus::Enabled => {}
            // Accounting off: nothing to track, nothing to enforce.
            KindStatus::Disabled => return Ok(()),
            _ => return Err(FsError::Busy),
        }
        // Identity 0 carries the kind defaults and is never charged.
        if identity == 0 {
            return Ok(());
        }
        let backing = st.backing.ok_or(FsError::QuotaOff)?;

        let rec = self.get_record(&st, backing, identity, kind)?;
        let now = self.clock.now_ns();
        let mut inner = rec.inner.lock();

        let unchecked = opts.force || opts.cred.is_quota_admin();
        if !unchecked {
            Self::check_limit(&mut inner, true, primary_delta, now, identity, kind)?;
            Self::check_limit(&mut inner, false, secondary_delta, now, identity, kind)?;
        }

        inner.used_primary = apply_delta(inner.used_primary, primary_delta);
        inner.used_secondary = apply_delta(inner.used_secondary, secondary_delta);
        Self::refresh_grace(
            &mut inner,
            now,
            st.grace_period_primary,
            st.grace_period_secondary,
        );
        inner.flags |= QuotaFlags::DIRTY;
        Ok(())
    }

    /// Limit check for one resource of a proposed positive delta. Usage is
    /// never mutated here; only the once-per-episode warned flags are.
    fn check_limit(
        inner: &mut RecordInner,
        primary: bool,
        delta: i64,
        now: u64,
        identity: u64,
        kind: QuotaKind,
    ) -> FsResult<()> {
        if delta <= 0 {
            return Ok(());
        }
        let (used, soft, hard, deadline, warned) = if primary {
            (
                inner.used_primary,
                inner.limits.soft_primary,
                inner.limits.hard_primary,
                inner.grace_primary,
                QuotaFlags::OVER_PRIMARY_WARNED,
            )
        } else {
            (
                inner.used_secondary,
                inner.limits.soft_secondary,
                inner.limits.hard_secondary,
                inner.grace_secondary,
                QuotaFlags::OVER_SECONDARY_WARNED,
            )
        };
        let requested = used.saturating_add(delta as u64);

        if hard != 0 && requested >= hard {
            if !inner.flags.contains(warned) {
                inner.flags.insert(warned);
                log::warn!(
                    "{:?} quota hard limit reached for identity {}",
                    kind,
                    identity
                );
            }
            return Err(FsError::HardLimitExceeded);
        }

        if soft != 0 && requested >= soft && used > soft {
            // Already over the soft limit; the grace deadline decides.
            if deadline != 0 && now > deadline {
                if !inner.flags.contains(warned) {
                    inner.flags.insert(warned);
                    log::warn!(
                        "{:?} quota grace period expired for identity {}",
                        kind,
                        identity
                    );
                }
                return Err(FsError::GraceExpired);
            }
        }
        // At or under the soft limit, or crossing it now: allowed. The
        // grace deadline is started when the delta is applied.
        Ok(())
    }

    /// Recompute grace deadlines, warned flags, and the fake marker after
    /// any usage or limit change. Deadlines start the instant usage sits
    /// over the soft limit and clear once it is back at or under it.
    fn refresh_grace(
        inner: &mut RecordInner,
        now: u64,
        grace_period_primary: u64,
        grace_period_secondary: u64,
    ) {
        if inner.limits.soft_primary != 0 && inner.used_primary > inner.limits.soft_primary {
            if inner.grace_primary == 0 {
                inner.grace_primary = now.saturating_add(grace_period_primary);
            }
        } else {
            inner.grace_primary = 0;
            inner.flags.remove(QuotaFlags::OVER_PRIMARY_WARNED);
        }

        if inner.limits.soft_secondary != 0
            && inner.used_secondary > inner.limits.soft_secondary
        {
            if inner.grace_secondary == 0 {
                inner.grace_secondary = now.saturating_add(grace_period_secondary);
            }
        } else {
            inner.grace_secondary = 0;
            inner.flags.remove(QuotaFlags::OVER_SECONDARY_WARNED);
        }

        if inner.limits.is_unlimited() {
            inner.flags.insert(QuotaFlags::FAKE);
        } else {
            inner.flags.remove(QuotaFlags::FAKE);
        }
    }

    /// Read-only snapshot of an identity's record. Unprivileged callers may
    /// only see their own identity unless the view-any capability is held or
    /// the unrestricted-view toggle is set.
    pub fn query(
        &self,
        identity: u64,
        kind: QuotaKind,
        cred: &Credential,
    ) -> FsResult<QuotaSnapshot> {
        self.check_view(identity, kind, cred)?;

        let st = self.kind(kind).read();
        let backing = Self::require_enabled(&st)?;
        let rec = self.get_record(&st, backing, identity, kind)?;
        let inner = rec.inner.lock();
        Ok(QuotaSnapshot {
            identity,
            kind,
            used_primary: inner.used_primary,
            used_secondary: inner.used_secondary,
            limits: inner.limits,
            grace_deadline_primary: inner.grace_primary,
            grace_deadline_secondary: inner.grace_secondary,
        })
    }

    fn check_view(&self, identity: u64, kind: QuotaKind, cred: &Credential) -> FsResult<()> {
        if cred.may_view_any() || self.unrestricted_view.load(Ordering::SeqCst) {
            return Ok(());
        }
        let own = match kind {
            QuotaKind::User => cred.uid as u64 == identity,
            QuotaKind::Group => cred.gid as u64 == identity,
        };
        if own {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    // ------------------------------------------------------------------
    // administrative updates
    // ------------------------------------------------------------------

    /// Replace an identity's limits, recomputing grace deadlines for usage
    /// that the new limits put newly over or newly under the soft limit.
    pub fn set_limits(
        &self,
        identity: u64,
        kind: QuotaKind,
        limits: QuotaLimits,
        cred: &Credential,
    ) -> FsResult<()> {
        Self::require_admin(cred)?;

        let st = self.kind(kind).read();
        let backing = Self::require_enabled(&st)?;
        let rec = self.get_record(&st, backing, identity, kind)?;
        let now = self.clock.now_ns();
        let mut inner = rec.inner.lock();
        inner.limits = limits;
        Self::refresh_grace(
            &mut inner,
            now,
            st.grace_period_primary,
            st.grace_period_secondary,
        );
        inner.flags |= QuotaFlags::DIRTY;
        Ok(())
    }

    /// Directly override an identity's usage counters (repair tooling),
    /// with the same grace recomputation as `set_limits`.
    pub fn set_usage(
        &self,
        identity: u64,
        kind: QuotaKind,
        used_primary: u64,
        used_secondary: u64,
        cred: &Credential,
    ) -> FsResult<()> {
        Self::require_admin(cred)?;

        let st = self.kind(kind).read();
        let backing = Self::require_enabled(&st)?;
        let rec = self.get_record(&st, backing, identity, kind)?;
        let now = self.clock.now_ns();
        let mut inner = rec.inner.lock();
        inner.used_primary = used_primary;
        inner.used_secondary = used_secondary;
        // Usage was rewritten from outside; the old deadline is meaningless.
        inner.grace_primary = 0;
        inner.grace_secondary = 0;
        Self::refresh_grace(
            &mut inner,
            now,
            st.grace_period_primary,
            st.grace_period_secondary,
        );
        inner.flags |= QuotaFlags::DIRTY;
        Ok(())
    }

    /// Move usage between two identities of the same kind (ownership
    /// change). Both sides are forced; the destination may end up over its
    /// limits, which the grace machinery then tracks.
    pub fn transfer(
        &self,
        from: u64,
        to: u64,
        kind: QuotaKind,
        primary: u64,
        secondary: u64,
        cred: &Credential,
    ) -> FsResult<()> {
        Self::require_admin(cred)?;
        if from == to || (primary == 0 && secondary == 0) {
            return Ok(());
        }

        let opts = ChargeOpts::forced(*cred);
        self.charge(from, kind, -(primary as i64), -(secondary as i64), &opts)?;
        if let Err(e) = self.charge(to, kind, primary as i64, secondary as i64, &opts) {
            // Put the source side back rather than losing the usage.
            if self
                .charge(from, kind, primary as i64, secondary as i64, &opts)
                .is_err()
            {
                log::warn!(
                    "{:?} quota transfer {} -> {} lost {}+{} units",
                    kind,
                    from,
                    to,
                    primary,
                    secondary
                );
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    /// Flush every dirty record of a kind to the backing object. Used at
    /// unmount and periodic checkpoint. No-op when the kind is disabled.
    pub fn sync(&self, kind: QuotaKind) -> FsResult<()> {
        let st = self.kind(kind).read();
        let backing = match st.status {
            KindStatus::Enabled => st.backing.ok_or(FsError::QuotaOff)?,
            KindStatus::Disabled => return Ok(()),
            _ => return Err(FsError::Busy),
        };

        for rec in st.records.values() {
            self.flush_record(backing, &rec)?;
        }
        self.store.sync()
    }

    /// Write one record back if dirty, holding its lock across the I/O.
    fn flush_record(&self, backing: ObjectId, rec: &QuotaRecord) -> FsResult<()> {
        let mut inner = rec.inner.lock();
        if !inner.flags.contains(QuotaFlags::DIRTY) {
            return Ok(());
        }
        let bytes = inner.serialize();
        self.store
            .write_at(backing, rec.identity * QUOTA_RECORD_SIZE as u64, &bytes)?;
        inner.flags.remove(QuotaFlags::DIRTY);
        log::debug!("flushed {:?} quota record {}", rec.kind, rec.identity);
        Ok(())
    }

    // ------------------------------------------------------------------
    // record access
    // ------------------------------------------------------------------

    fn get_record(
        &self,
        st: &KindState,
        backing: ObjectId,
        identity: u64,
        kind: QuotaKind,
    ) -> FsResult<Arc<QuotaRecord>> {
        if let Some(rec) = st.records.get(identity) {
            return Ok(rec);
        }
        // Read before taking the shard write lock; the loser of a racing
        // load simply drops its copy.
        let rec = self.read_backing_record(backing, identity, kind)?;
        Ok(st.records.get_or_insert(identity, Arc::new(rec)))
    }

    fn read_backing_record(
        &self,
        backing: ObjectId,
        identity: u64,
        kind: QuotaKind,
    ) -> FsResult<QuotaRecord> {
        let offset = identity * QUOTA_RECORD_SIZE as u64;
        let bytes = self.store.read_at(backing, offset, QUOTA_RECORD_SIZE)?;
        Ok(QuotaRecord::from_disk(identity, kind, &bytes))
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        // Releases clamp at zero; the safe direction is never blocked.
        value.saturating_sub(delta.unsigned_abs())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryStore;
    use crate::time::ManualClock;

    const UID: u64 = 1000;

    fn admin() -> Credential {
        Credential::admin(0, 0)
    }

    fn user() -> Credential {
        Credential::user(UID as u32, 100)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        ledger: QuotaLedger<MemoryStore, Arc<ManualClock>>,
        backing: ObjectId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let backing = store.allocate_object(0, None).expect("alloc backing");
        let ledger = QuotaLedger::with_clock(store.clone(), clock.clone());
        Fixture {
            store,
            clock,
            ledger,
            backing,
        }
    }

    fn enabled_fixture() -> Fixture {
        let f = fixture();
        f.ledger
            .enable(QuotaKind::User, f.backing, &[], &admin())
            .expect("enable");
        f
    }

    fn set_limits(f: &Fixture, soft: u64, hard: u64) {
        f.ledger
            .set_limits(
                UID,
                QuotaKind::User,
                QuotaLimits {
                    soft_primary: soft,
                    hard_primary: hard,
                    soft_secondary: 0,
                    hard_secondary: 0,
                },
                &admin(),
            )
            .expect("set_limits");
    }

    fn charge(f: &Fixture, delta: i64) -> FsResult<()> {
        f.ledger
            .charge(UID, QuotaKind::User, delta, 0, &ChargeOpts::new(user()))
    }

    fn usage(f: &Fixture) -> u64 {
        f.ledger
            .query(UID, QuotaKind::User, &user())
            .expect("query")
            .used_primary
    }

    #[test]
    fn test_record_codec_roundtrip() {
        let inner = RecordInner {
            used_primary: 11,
            used_secondary: 22,
            limits: QuotaLimits {
                soft_primary: 100,
                hard_primary: 200,
                soft_secondary: 10,
                hard_secondary: 20,
            },
            grace_primary: 12345,
            grace_secondary: 0,
            flags: QuotaFlags::empty(),
        };
        let buf = inner.serialize();
        let back = RecordInner::deserialize(&buf);
        assert_eq!(back.used_primary, 11);
        assert_eq!(back.used_secondary, 22);
        assert_eq!(back.limits, inner.limits);
        assert_eq!(back.grace_primary, 12345);
        assert!(!back.flags.contains(QuotaFlags::FAKE));

        let fake = RecordInner::deserialize(&[0u8; QUOTA_RECORD_SIZE]);
        assert!(fake.flags.contains(QuotaFlags::FAKE));
    }

    #[test]
    fn test_enable_requires_admin() {
        let f = fixture();
        assert_eq!(
            f.ledger.enable(QuotaKind::User, f.backing, &[], &user()),
            Err(FsError::PermissionDenied)
        );
        assert_eq!(f.ledger.status(QuotaKind::User), KindStatus::Disabled);
    }

    #[test]
    fn test_enable_and_double_enable() {
        let f = enabled_fixture();
        assert_eq!(f.ledger.status(QuotaKind::User), KindStatus::Enabled);
        // Kinds are independent.
        assert_eq!(f.ledger.status(QuotaKind::Group), KindStatus::Disabled);

        assert_eq!(
            f.ledger.enable(QuotaKind::User, f.backing, &[], &admin()),
            Err(FsError::Busy)
        );
    }

    #[test]
    fn test_enable_missing_backing_rolls_back() {
        let f = fixture();
        assert_eq!(
            f.ledger.enable(QuotaKind::User, 9999, &[], &admin()),
            Err(FsError::NotFound)
        );
        assert_eq!(f.ledger.status(QuotaKind::User), KindStatus::Disabled);
    }

    #[test]
    fn test_enable_read_failure_rolls_back() {
        let f = fixture();
        f.store.fail_next_read();
        assert_eq!(
            f.ledger.enable(QuotaKind::User, f.backing, &[UID], &admin()),
            Err(FsError::StorageError)
        );
        assert_eq!(f.ledger.status(QuotaKind::User), KindStatus::Disabled);
    }

    #[test]
    fn test_grace_periods_load_from_identity_zero() {
        let f = fixture();
        // Identity-0 record with 1000ns primary grace, default secondary.
        let zero = RecordInner {
            used_primary: 0,
            used_secondary: 0,
            limits: QuotaLimits::unlimited(),
            grace_primary: 1_000,
            grace_secondary: 0,
            flags: QuotaFlags::empty(),
        };
        f.store
            .write_at(f.backing, 0, &zero.serialize())
            .expect("seed");

        f.ledger
            .enable(QuotaKind::User, f.backing, &[], &admin())
            .expect("enable");
        assert_eq!(
            f.ledger.grace_periods(QuotaKind::User),
            (1_000, DEFAULT_GRACE_PERIOD)
        );
    }

    #[test]
    fn test_charge_disabled_kind_is_noop() {
        let f = fixture();
        assert_eq!(charge(&f, 100), Ok(()));
        assert_eq!(
            f.ledger.query(UID, QuotaKind::User, &user()),
            Err(FsError::QuotaOff)
        );
    }

    #[test]
    fn test_charge_and_release_clamp() {
        let f = enabled_fixture();
        charge(&f, 50).expect("charge");
        assert_eq!(usage(&f), 50);

        // Release more than held: clamps at zero, never blocked.
        charge(&f, -80).expect("release");
        assert_eq!(usage(&f), 0);
    }

    #[test]
    fn test_hard_limit_rejected_without_mutation() {
        let f = enabled_fixture();
        set_limits(&f, 0, 100);
        charge(&f, 50).expect("charge");

        // used + delta == hard counts as exceeded.
        assert_eq!(charge(&f, 50), Err(FsError::HardLimitExceeded));
        assert_eq!(usage(&f), 50);

        assert_eq!(charge(&f, 49), Ok(()));
        assert_eq!(usage(&f), 99);
    }

    #[test]
    fn test_admin_and_force_bypass_limits() {
        let f = enabled_fixture();
        set_limits(&f, 0, 100);

        f.ledger
            .charge(UID, QuotaKind::User, 500, 0, &ChargeOpts::new(admin()))
            .expect("admin charge");
        assert_eq!(usage(&f), 500);

        f.ledger
            .charge(UID, QuotaKind::User, 100, 0, &ChargeOpts::forced(user()))
            .expect("forced charge");
        assert_eq!(usage(&f), 600);
    }

    #[test]
    fn test_soft_limit_grace_cycle() {
        let f = enabled_fixture();
        set_limits(&f, 100, 0);

        // Crossing the soft limit starts the grace window and allows.
        charge(&f, 150).expect("cross soft");
        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert!(snap.over_soft_primary());
        assert_eq!(
            snap.grace_deadline_primary,
            f.clock.now_ns() + DEFAULT_GRACE_PERIOD
        );

        // Inside the window further charges pass.
        charge(&f, 10).expect("within grace");

        // Past the deadline they are rejected, usage untouched.
        f.clock.advance(DEFAULT_GRACE_PERIOD + 1);
        assert_eq!(charge(&f, 10), Err(FsError::GraceExpired));
        assert_eq!(usage(&f), 160);

        // Releases still work and dropping to the soft limit clears grace.
        charge(&f, -60).expect("release");
        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_eq!(snap.used_primary, 100);
        assert_eq!(snap.grace_deadline_primary, 0);

        // A fresh episode gets a fresh window.
        charge(&f, 20).expect("re-cross");
        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_ne!(snap.grace_deadline_primary, 0);
    }

    #[test]
    fn test_secondary_resource_checked_independently() {
        let f = enabled_fixture();
        f.ledger
            .set_limits(
                UID,
                QuotaKind::User,
                QuotaLimits {
                    soft_primary: 0,
                    hard_primary: 0,
                    soft_secondary: 0,
                    hard_secondary: 10,
                },
                &admin(),
            )
            .expect("set_limits");

        // Primary unlimited, secondary capped: a combined charge whose
        // secondary part trips the hard limit must leave both untouched.
        assert_eq!(
            f.ledger
                .charge(UID, QuotaKind::User, 1000, 10, &ChargeOpts::new(user())),
            Err(FsError::HardLimitExceeded)
        );
        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_eq!(snap.used_primary, 0);
        assert_eq!(snap.used_secondary, 0);

        f.ledger
            .charge(UID, QuotaKind::User, 1000, 9, &ChargeOpts::new(user()))
            .expect("charge");
    }

    #[test]
    fn test_set_limits_recomputes_grace() {
        let f = enabled_fixture();
        set_limits(&f, 100, 0);
        charge(&f, 150).expect("charge");

        // Raising the soft limit above usage clears the deadline.
        set_limits(&f, 200, 0);
        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_eq!(snap.grace_deadline_primary, 0);

        // Lowering it back under usage starts a new one.
        set_limits(&f, 100, 0);
        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_ne!(snap.grace_deadline_primary, 0);
    }

    #[test]
    fn test_set_usage_override() {
        let f = enabled_fixture();
        set_limits(&f, 100, 0);
        f.ledger
            .set_usage(UID, QuotaKind::User, 500, 3, &admin())
            .expect("set_usage");

        let snap = f.ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_eq!(snap.used_primary, 500);
        assert_eq!(snap.used_secondary, 3);
        assert_ne!(snap.grace_deadline_primary, 0);

        assert_eq!(
            f.ledger.set_usage(UID, QuotaKind::User, 0, 0, &user()),
            Err(FsError::PermissionDenied)
        );
    }

    #[test]
    fn test_transfer_moves_usage() {
        let f = enabled_fixture();
        charge(&f, 100).expect("charge");
        f.ledger
            .charge(UID, QuotaKind::User, 0, 4, &ChargeOpts::new(user()))
            .expect("charge secondary");

        f.ledger
            .transfer(UID, 2000, QuotaKind::User, 30, 1, &admin())
            .expect("transfer");

        let from = f.ledger.query(UID, QuotaKind::User, &admin()).expect("query");
        let to = f
            .ledger
            .query(2000, QuotaKind::User, &admin())
            .expect("query");
        assert_eq!(from.used_primary, 70);
        assert_eq!(from.used_secondary, 3);
        assert_eq!(to.used_primary, 30);
        assert_eq!(to.used_secondary, 1);
    }

    #[test]
    fn test_query_permissions() {
        let f = enabled_fixture();
        charge(&f, 10).expect("charge");

        // Own identity: allowed. Foreign identity: denied.
        assert!(f.ledger.query(UID, QuotaKind::User, &user()).is_ok());
        assert_eq!(
            f.ledger.query(2000, QuotaKind::User, &user()),
            Err(FsError::PermissionDenied)
        );

        // View-any capability and the unrestricted toggle both open it up.
        assert!(f.ledger.query(2000, QuotaKind::User, &admin()).is_ok());
        f.ledger.set_unrestricted_view(true);
        assert!(f.ledger.query(2000, QuotaKind::User, &user()).is_ok());
        f.ledger.set_unrestricted_view(false);
        assert_eq!(
            f.ledger.query(2000, QuotaKind::User, &user()),
            Err(FsError::PermissionDenied)
        );
    }

    #[test]
    fn test_sync_persists_and_reload() {
        let f = enabled_fixture();
        set_limits(&f, 100, 200);
        charge(&f, 42).expect("charge");
        f.ledger.sync(QuotaKind::User).expect("sync");
        f.ledger.disable(QuotaKind::User, &admin()).expect("disable");

        // A fresh ledger over the same store sees the persisted state.
        let ledger2 = QuotaLedger::with_clock(f.store.clone(), f.clock.clone());
        ledger2
            .enable(QuotaKind::User, f.backing, &[UID], &admin())
            .expect("re-enable");
        let snap = ledger2.query(UID, QuotaKind::User, &admin()).expect("query");
        assert_eq!(snap.used_primary, 42);
        assert_eq!(snap.limits.soft_primary, 100);
        assert_eq!(snap.limits.hard_primary, 200);
    }

    #[test]
    fn test_disable_flushes_dirty_records() {
        let f = enabled_fixture();
        charge(&f, 7).expect("charge");
        let writes_before = f.store.writes();
        f.ledger.disable(QuotaKind::User, &admin()).expect("disable");
        assert!(f.store.writes() > writes_before);
        assert_eq!(f.ledger.status(QuotaKind::User), KindStatus::Disabled);

        // Double disable reports the kind as off.
        assert_eq!(
            f.ledger.disable(QuotaKind::User, &admin()),
            Err(FsError::QuotaOff)
        );
    }

    #[test]
    fn test_concurrent_charges_single_identity() {
        let f = enabled_fixture();
        let ledger = Arc::new(f.ledger);
        let mut threads = Vec::new();
        for _ in 0..4 {
            let ledger = ledger.clone();
            threads.push(std::thread::spawn(move || {
                let opts = ChargeOpts::new(user());
                for _ in 0..500 {
                    ledger
                        .charge(UID, QuotaKind::User, 1, 0, &opts)
                        .expect("charge");
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        let snap = ledger.query(UID, QuotaKind::User, &user()).expect("query");
        assert_eq!(snap.used_primary, 4 * 500);
    }
}
