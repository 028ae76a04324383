//! Retired objects waiting for their epoch slot to become quiescent.

use core::mem;
use core::ptr::{self, NonNull};

use crate::alloc::{free_node, NodeAllocator};
use crate::epoch::{Epoch, EBR_EPOCHS};

/// Destroys a retired object. Takes the object that was passed to `queue_for_deletion`.
pub type Deleter = unsafe fn(*mut u8);

/// Deleter of objects allocated with `Box<T>`.
pub(crate) unsafe fn drop_box<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut T))
}

/// A retired object together with the means of destroying it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Retired {
    pub(crate) object: NonNull<u8>,
    pub(crate) deleter: Deleter,
    pub(crate) size: usize,
}

// The caller of `queue_for_deletion` promises that the object may be destroyed on any thread.
unsafe impl Send for Retired {}

impl Retired {
    /// Runs the deleter.
    ///
    /// # Safety
    ///
    /// The object must be unreachable by every thread, and this must be called at most once.
    #[inline]
    pub(crate) unsafe fn delete(self) {
        (self.deleter)(self.object.as_ptr())
    }
}

/// A node of a pending list.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    retired: Retired,
    next: *mut PendingEntry,
}

impl PendingEntry {
    pub(crate) fn new(retired: Retired) -> Self {
        Self {
            retired,
            next: ptr::null_mut(),
        }
    }
}

/// One pending list per epoch slot. Guarded by the collector's pending lock.
#[derive(Debug)]
pub(crate) struct PendingQueues {
    heads: [*mut PendingEntry; EBR_EPOCHS as usize],
}

unsafe impl Send for PendingQueues {}

impl PendingQueues {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [ptr::null_mut(); EBR_EPOCHS as usize],
        }
    }

    /// Links `entry` into the list of `epoch`.
    pub(crate) fn push(&mut self, epoch: Epoch, entry: NonNull<PendingEntry>) {
        let head = &mut self.heads[epoch.slot()];
        unsafe { (*entry.as_ptr()).next = *head };
        *head = entry.as_ptr();
    }

    /// Takes the whole list of `epoch`, leaving it empty.
    pub(crate) fn detach(&mut self, epoch: Epoch) -> DetachedQueue {
        DetachedQueue {
            head: mem::replace(&mut self.heads[epoch.slot()], ptr::null_mut()),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.heads.iter().all(|head| head.is_null())
    }
}

/// A pending list detached from its slot. Dropping it without draining leaks the entries.
#[derive(Debug)]
#[must_use]
pub(crate) struct DetachedQueue {
    head: *mut PendingEntry,
}

unsafe impl Send for DetachedQueue {}

impl DetachedQueue {
    /// Frees the entries one by one, yielding what they held.
    ///
    /// # Safety
    ///
    /// The entries must have been allocated by `allocator`.
    pub(crate) unsafe fn drain(self, allocator: &dyn NodeAllocator) -> Drain<'_> {
        Drain {
            cur: self.head,
            allocator,
        }
    }
}

pub(crate) struct Drain<'a> {
    cur: *mut PendingEntry,
    allocator: &'a dyn NodeAllocator,
}

impl Iterator for Drain<'_> {
    type Item = Retired;

    fn next(&mut self) -> Option<Retired> {
        let cur = NonNull::new(self.cur)?;
        let entry = unsafe { free_node(self.allocator, cur) };
        self.cur = entry.next;
        Some(entry.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingEntry, PendingQueues, Retired};
    use crate::alloc::{alloc_node, SystemAllocator};
    use crate::epoch::Epoch;
    use core::ptr::NonNull;

    unsafe fn noop(_: *mut u8) {}

    fn entry(size: usize) -> NonNull<PendingEntry> {
        let retired = Retired {
            object: NonNull::dangling(),
            deleter: noop,
            size,
        };
        alloc_node(&SystemAllocator, PendingEntry::new(retired)).unwrap()
    }

    #[test]
    fn slots_are_independent() {
        let mut queues = PendingQueues::new();
        assert!(queues.is_empty());

        let zero = Epoch::starting();
        let one = zero.successor();
        queues.push(zero, entry(1));
        queues.push(zero, entry(2));
        queues.push(one, entry(10));
        assert!(!queues.is_empty());

        let sizes: Vec<_> = unsafe { queues.detach(zero).drain(&SystemAllocator) }
            .map(|retired| retired.size)
            .collect();
        assert_eq!(sizes, vec![2, 1]);

        // Detaching again yields nothing.
        assert_eq!(
            unsafe { queues.detach(zero).drain(&SystemAllocator) }.count(),
            0
        );
        assert_eq!(
            unsafe { queues.detach(one.successor()).drain(&SystemAllocator) }.count(),
            0
        );

        let sizes: Vec<_> = unsafe { queues.detach(one).drain(&SystemAllocator) }
            .map(|retired| retired.size)
            .collect();
        assert_eq!(sizes, vec![10]);
        assert!(queues.is_empty());
    }
}
