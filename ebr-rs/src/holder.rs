//! Scoped critical regions.
//!
//! A [`CriticalRegionHolder`] enters a region on construction and leaves it on drop. A disabled
//! holder does nothing, which lets callers make protection conditional without branching.

use core::fmt;
use core::marker::PhantomData;
use core::mem;

use crate::collector::Collector;
use crate::error::EbrError;
use crate::pending::{drop_box, Deleter};
use crate::reclaimer::Reclaimer;

/// A witness that the current thread is inside a critical region.
///
/// Entering happens on construction and exiting when the holder is dropped, so the region is left
/// on every path, including early returns and unwinding. A holder constructed with
/// `enable == false` does nothing at all, which lets call sites participate in reclamation only
/// conditionally.
///
/// Holders are tied to the thread that created them and cannot be cloned.
pub struct CriticalRegionHolder<'r, R: Reclaimer + ?Sized = Collector> {
    reclaimer: Option<&'r R>,
    _marker: PhantomData<*const ()>,
}

impl<'r, R: Reclaimer + ?Sized> CriticalRegionHolder<'r, R> {
    /// Enters a critical region of `reclaimer` if `enable` is set.
    pub fn new(reclaimer: &'r R, enable: bool) -> Result<Self, EbrError> {
        if !enable {
            return Ok(Self::disabled());
        }
        reclaimer.enter_critical_region()?;
        Ok(Self {
            reclaimer: Some(reclaimer),
            _marker: PhantomData,
        })
    }

    /// Returns a holder that does not protect anything.
    pub const fn disabled() -> Self {
        Self {
            reclaimer: None,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if the holder keeps a critical region open.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.reclaimer.is_some()
    }

    /// Returns the reclaimer whose region is held, if any.
    #[inline]
    pub fn reclaimer(&self) -> Option<&'r R> {
        self.reclaimer
    }

    /// Queues `object` for deletion under the held region.
    ///
    /// A disabled holder fails with [`EbrError::NotInCriticalRegion`].
    ///
    /// # Safety
    ///
    /// See [`Collector::queue_for_deletion`].
    pub unsafe fn queue_for_deletion(
        &self,
        object: *mut u8,
        deleter: Deleter,
        estimated_size: usize,
    ) -> Result<(), EbrError> {
        match self.reclaimer {
            Some(reclaimer) => reclaimer.queue_for_deletion(object, deleter, estimated_size),
            None => Err(EbrError::NotInCriticalRegion),
        }
    }

    /// Queues a boxed `T` for deletion under the held region.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`; see also [`Collector::queue_for_deletion`].
    pub unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) -> Result<(), EbrError> {
        self.queue_for_deletion(ptr as *mut u8, drop_box::<T>, mem::size_of::<T>())
    }

    /// Leaves the critical region while running `f`, and enters it again afterwards, even if `f`
    /// panics.
    ///
    /// References obtained under the region must not be carried across `f`.
    pub fn exit_during<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let Some(reclaimer) = self.reclaimer else {
            return f();
        };
        if let Err(err) = reclaimer.exit_critical_region() {
            tracing::error!(target: "ebr", %err, "failed to exit critical region");
            self.reclaimer = None;
            return f();
        }

        let _reenter = scopeguard::guard(&mut self.reclaimer, |slot| {
            if let Err(err) = reclaimer.enter_critical_region() {
                tracing::error!(target: "ebr", %err, "failed to re-enter critical region");
                *slot = None;
            }
        });
        f()
    }
}

impl<R: Reclaimer + ?Sized> Drop for CriticalRegionHolder<'_, R> {
    fn drop(&mut self) {
        if let Some(reclaimer) = self.reclaimer {
            if let Err(err) = reclaimer.exit_critical_region() {
                tracing::error!(target: "ebr", %err, "failed to exit critical region");
            }
        }
    }
}

impl<R: Reclaimer + ?Sized> fmt::Debug for CriticalRegionHolder<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalRegionHolder")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
