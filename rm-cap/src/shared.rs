//! Handle-counted shared state
//!
//! Duplicated handles share one backing object. [`SharedRef`] counts the
//! client-visible references explicitly (separately from the `Arc` strong
//! count, which internal back-references also hold) and runs
//! [`LastRelease::last_release`] exactly once when the final handle goes.
//!
//! ```text
//! client A: hCtxShare ──┐
//!                       ├──► SharedRef<ContextShareRecord>  (handles = 2)
//! client B: hDup     ───┘
//! ```

use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Teardown run when the last handle to a shared object is released.
pub trait LastRelease {
    /// Release everything the object holds outside itself (ids, hardware
    /// state). Called exactly once.
    fn last_release(&self);
}

struct Shared<T> {
    value: T,
    handles: AtomicUsize,
}

/// A handle-visible reference to shared state.
///
/// Cloning adds a handle reference; dropping removes one.
pub struct SharedRef<T: LastRelease> {
    inner: Arc<Shared<T>>,
}

impl<T: LastRelease> SharedRef<T> {
    /// Wrap `value` with a handle count of one.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Shared {
                value,
                handles: AtomicUsize::new(1),
            }),
        }
    }

    /// Number of live handle references.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.handles.load(Ordering::Acquire)
    }

    /// Create a non-counting internal reference.
    #[must_use]
    pub fn internal(&self) -> InternalRef<T> {
        InternalRef {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Check whether two references share one backing object.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: LastRelease> Clone for SharedRef<T> {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: LastRelease> Drop for SharedRef<T> {
    fn drop(&mut self) {
        if self.inner.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            log::trace!("shared object: last handle released");
            self.inner.value.last_release();
        }
    }
}

impl<T: LastRelease> Deref for SharedRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: LastRelease + fmt::Debug> fmt::Debug for SharedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRef")
            .field("handles", &self.ref_count())
            .field("value", &self.inner.value)
            .finish()
    }
}

/// A reference that keeps the storage alive without counting as a handle.
///
/// Held by objects that need to reach shared state they do not own (a
/// subcontext record reaching its channel group).
pub struct InternalRef<T: LastRelease> {
    inner: Arc<Shared<T>>,
}

impl<T: LastRelease> InternalRef<T> {
    /// Number of live handle references on the target.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.handles.load(Ordering::Acquire)
    }

    /// Check whether this points at the same object as `shared`.
    #[inline]
    #[must_use]
    pub fn refers_to(&self, shared: &SharedRef<T>) -> bool {
        Arc::ptr_eq(&self.inner, &shared.inner)
    }
}

impl<T: LastRelease> Clone for InternalRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: LastRelease> Deref for InternalRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: LastRelease> fmt::Debug for InternalRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalRef")
            .field("handles", &self.ref_count())
            .finish_non_exhaustive()
    }
}
