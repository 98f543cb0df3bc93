// TideFS Time — Clock source abstraction

/// Clock trait for time abstraction
pub trait Clock: Send + Sync {
    /// Get current time in nanoseconds since Unix epoch
    fn now_ns(&self) -> u64;

    /// Get current time in seconds since Unix epoch
    fn now_secs(&self) -> u64 {
        self.now_ns() / 1_000_000_000
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// System clock implementation
#[derive(Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// A clock that can be manually set (useful for grace-period testing)
pub struct ManualClock {
    current_ns: core::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn new(initial_ns: u64) -> Self {
        Self {
            current_ns: core::sync::atomic::AtomicU64::new(initial_ns),
        }
    }

    pub fn set(&self, ns: u64) {
        self.current_ns
            .store(ns, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) {
        self.current_ns
            .fetch_add(ns, core::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.current_ns.load(core::sync::atomic::Ordering::SeqCst)
    }
}
