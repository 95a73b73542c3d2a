//! Locking primitives
//!
//! Spin-locks come from the `spin` crate and cover short critical sections
//! that never suspend (buffer-cache shards, the COW reference table, fd
//! tables). [`SleepLock`] covers long-held, I/O-bound resources -- its
//! acquire path may give up the CPU. [`OnceLock`] holds write-once globals
//! such as the registered buffer cache.

pub mod once_lock;
pub mod sleep_lock;

pub use once_lock::OnceLock;
pub use sleep_lock::{SleepLock, SleepLockGuard};
