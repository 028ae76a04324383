//! The reclamation capability, abstracted so that data structures and tests can swap in their
//! own implementation.

use crate::collector::Collector;
use crate::error::EbrError;
use crate::pending::Deleter;

/// The reclamation capability consumed by protected data structures.
///
/// [`Collector`] is the real implementation. Code written against this trait (most notably
/// [`CriticalRegionHolder`](crate::CriticalRegionHolder)) can be exercised with test doubles.
pub trait Reclaimer {
    fn enter_critical_region(&self) -> Result<(), EbrError>;

    fn exit_critical_region(&self) -> Result<(), EbrError>;

    fn in_critical_region(&self) -> bool;

    /// # Safety
    ///
    /// See [`Collector::queue_for_deletion`].
    unsafe fn queue_for_deletion(
        &self,
        object: *mut u8,
        deleter: Deleter,
        estimated_size: usize,
    ) -> Result<(), EbrError>;

    fn thread_detach(&self) -> bool;

    fn clean_up_requested(&self) -> bool;

    fn clean_up_pending(&self) -> usize;
}

impl Reclaimer for Collector {
    #[inline]
    fn enter_critical_region(&self) -> Result<(), EbrError> {
        Collector::enter_critical_region(self)
    }

    #[inline]
    fn exit_critical_region(&self) -> Result<(), EbrError> {
        Collector::exit_critical_region(self)
    }

    #[inline]
    fn in_critical_region(&self) -> bool {
        Collector::in_critical_region(self)
    }

    #[inline]
    unsafe fn queue_for_deletion(
        &self,
        object: *mut u8,
        deleter: Deleter,
        estimated_size: usize,
    ) -> Result<(), EbrError> {
        Collector::queue_for_deletion(self, object, deleter, estimated_size)
    }

    #[inline]
    fn thread_detach(&self) -> bool {
        Collector::thread_detach(self)
    }

    #[inline]
    fn clean_up_requested(&self) -> bool {
        Collector::clean_up_requested(self)
    }

    #[inline]
    fn clean_up_pending(&self) -> usize {
        Collector::clean_up_pending(self)
    }
}
