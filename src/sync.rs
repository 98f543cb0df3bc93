//! Lock primitives used throughout the crate. `parking_lot` gives us
//! non-poisoning guards and queued wakeups, which stands in for the classic
//! lock/wanted-flag discipline: a thread that finds a record locked simply
//! parks and is woken when the holder releases.

pub type Mutex<T> = parking_lot::Mutex<T>;
pub type RwLock<T> = parking_lot::RwLock<T>;
pub use parking_lot::{MutexGuard, RwLockReadGuard, RwLockWriteGuard};
