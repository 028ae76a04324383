//! Epoch values and their modular arithmetic.
//!
//! The global epoch cycles through [`EBR_EPOCHS`] values. Three are necessary and sufficient: an
//! object retired while the global epoch was `e` may still be referenced by a thread that observed
//! `e` (or `e - 1`, if it has not yet acknowledged the latest advance), but never by one that
//! observed `e - 2` while the global epoch has moved on to `e + 2`. Hence, right after the global
//! epoch advances to `n`, the slot of `n - 2` is quiescent and its retirements can be destroyed.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// The number of epoch slots.
pub const EBR_EPOCHS: u32 = 3;

/// An epoch, i.e. a value in `[0, EBR_EPOCHS)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Epoch(u32);

impl Epoch {
    /// The epoch every collector starts in.
    pub const fn starting() -> Self {
        Epoch(0)
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Epoch(raw % EBR_EPOCHS)
    }

    /// Returns the raw value of the epoch.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the index of the pending-deletion slot of this epoch.
    #[inline]
    pub const fn slot(self) -> usize {
        self.0 as usize
    }

    /// Returns the epoch that follows `self`.
    #[inline]
    pub const fn successor(self) -> Self {
        Epoch((self.0 + 1) % EBR_EPOCHS)
    }

    /// Returns the epoch whose retirements become safe to destroy once the global epoch has
    /// advanced to `self`.
    #[inline]
    pub const fn reclaimable(self) -> Self {
        Epoch((self.0 + EBR_EPOCHS - 2) % EBR_EPOCHS)
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An atomic cell holding an [`Epoch`].
#[derive(Debug, Default)]
pub(crate) struct AtomicEpoch(AtomicU32);

impl AtomicEpoch {
    pub(crate) const fn new(epoch: Epoch) -> Self {
        AtomicEpoch(AtomicU32::new(epoch.0))
    }

    #[inline]
    pub(crate) fn load(&self, ord: Ordering) -> Epoch {
        Epoch::from_raw(self.0.load(ord))
    }

    #[inline]
    pub(crate) fn store(&self, epoch: Epoch, ord: Ordering) {
        self.0.store(epoch.0, ord);
    }

    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: Epoch,
        new: Epoch,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Epoch, Epoch> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(Epoch::from_raw)
            .map_err(Epoch::from_raw)
    }
}
