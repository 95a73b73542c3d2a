//! Write-once global cells
//!
//! A `no_std` stand-in for `std::sync::OnceLock`, used for globals that are
//! installed exactly once during boot (the buffer cache, the registered
//! block device) and read for the rest of the kernel's lifetime.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written to only once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set` via
            // `Box::into_raw`, so it refers to a valid leaked `T`. The
            // Acquire load synchronizes with the Release store in `set`.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost the race; reclaim our allocation and hand the value
                // back to the caller.
                // SAFETY: `ptr` came from `Box::into_raw` above and no one
                // else has seen it.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = *self.inner.get_mut();
        if !ptr.is_null() {
            // SAFETY: the pointer was leaked by `set` and never freed.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7u32).is_ok());
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn second_set_rejected() {
        let cell = OnceLock::new();
        cell.set("first").unwrap();
        assert_eq!(cell.set("second"), Err("second"));
        assert_eq!(cell.get(), Some(&"first"));
    }
}
