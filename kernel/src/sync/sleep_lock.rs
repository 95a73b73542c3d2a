//! Sleep-locks
//!
//! A mutex whose `lock` may suspend the calling thread, for resources held
//! across disk I/O. The rule the rest of the kernel follows: a sleep-lock
//! is acquired only after every spin-lock is released, and a thread holds
//! at most one sleep-lock at a time.
//!
//! Suspension itself belongs to the external scheduler. While contended,
//! this implementation yields the CPU on hosted targets and issues a spin
//! hint on bare metal; the embedding kernel parks the thread on a wait
//! channel instead by swapping in its own relax hook at the bottom of this
//! file.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A lock that may block the holder for a long time (e.g. across `disk_rw`).
pub struct SleepLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol guarantees exclusive access to `data` while a
// guard exists, so sharing the lock across threads is sound whenever the
// payload itself may move between threads.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, suspending until it is free.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            relax();
        }
        SleepLockGuard { lock: self }
    }

    /// Whether some thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII guard; the lock is released on drop.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock, so no other
        // reference to the payload exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, plus the guard is borrowed mutably.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(not(target_os = "none"))]
fn relax() {
    std::thread::yield_now();
}

#[cfg(target_os = "none")]
fn relax() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_gives_exclusive_access() {
        let lock = SleepLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn contended_increments_all_land() {
        let lock = Arc::new(SleepLock::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
