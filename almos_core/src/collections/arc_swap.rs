//! This module provides the `ArcSwap` type, which allows atomic load and swap operations on an `Arc<T>`.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A thread-safe storage for an `Arc<T>` that can be atomically loaded and swapped.
///
/// This type provides atomic operations for loading and swapping an `Arc<T>`.
pub struct ArcSwap<T> {
    ptr: AtomicPtr<T>,
}

impl<T> ArcSwap<T> {
    /// Creates a new `ArcSwap` instance holding the given `Arc<T>`.
    pub fn new(data: Arc<T>) -> Self {
        let ptr = Arc::into_raw(data).cast_mut();
        Self {
            ptr: AtomicPtr::new(ptr),
        }
    }

    /// Atomically loads an `Arc<T>` to the current value.
    ///
    /// This method increments the strong count of the `Arc<T>` and returns a new `Arc<T>`.
    pub fn load(&self) -> Arc<T> {
        let ptr = self.ptr.load(Ordering::Acquire);
        // SAFETY: We increase the strong count before creating a new Arc.
        // The pointer is valid because it was obtained from Arc::into_raw.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Atomically swaps the current value with a new `Arc<T>`, returning the old `Arc<T>`.
    pub fn swap(&self, new: Arc<T>) -> Arc<T> {
        let new_ptr = Arc::into_raw(new).cast_mut();
        let old_ptr = self.ptr.swap(new_ptr, Ordering::AcqRel);
        // SAFETY: The old pointer was obtained from Arc::into_raw, so it's safe to create an Arc.
        unsafe { Arc::from_raw(old_ptr) }
    }
}

impl<T> Drop for ArcSwap<T> {
    fn drop(&mut self) {
        let ptr = self.ptr.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: We have exclusive access to `self`, so we can safely create an `Arc<T>`
            // and allow it to be dropped, which will decrement the strong count.
            unsafe {
                drop(Arc::from_raw(ptr));
            }
        }
    }
}
