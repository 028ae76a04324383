//! Per-thread participation records and the list that owns them.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::epoch::{AtomicEpoch, Epoch};

/// Participation record of one thread in one collector.
///
/// Created the first time a thread enters a critical region of the collector, and never moved
/// afterwards. `observed_epoch` and `region_depth` are written only by the owning thread; other
/// threads read them while deciding whether the global epoch may advance.
#[derive(Debug)]
pub(crate) struct ThreadData {
    region: CachePadded<RegionState>,
    detached: AtomicBool,
    /// Guarded by the thread-list lock.
    next: AtomicPtr<ThreadData>,
}

#[derive(Debug)]
struct RegionState {
    observed_epoch: AtomicEpoch,
    depth: AtomicU32,
}

impl ThreadData {
    pub(crate) fn new() -> Self {
        Self {
            region: CachePadded::new(RegionState {
                observed_epoch: AtomicEpoch::new(Epoch::starting()),
                depth: AtomicU32::new(0),
            }),
            detached: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Enters a critical region. Returns whether this is the outermost region.
    ///
    /// Must only be called by the owning thread.
    #[inline]
    pub(crate) fn enter(&self, global_epoch: &AtomicEpoch) -> bool {
        let depth = self.region.depth.load(Ordering::Relaxed);
        if depth > 0 {
            let depth = depth
                .checked_add(1)
                .expect("critical region nesting depth overflowed");
            self.region.depth.store(depth, Ordering::Relaxed);
            return false;
        }

        let epoch = global_epoch.load(Ordering::Acquire);
        self.region.observed_epoch.store(epoch, Ordering::Relaxed);
        // Publishes the snapshot together with the depth: a scanner that sees us inside a region
        // also sees the epoch we entered it at.
        self.region.depth.store(1, Ordering::Release);
        // Orders the publication above before any read of the protected structure, pairing with
        // the fence of the scanner.
        fence(Ordering::SeqCst);
        true
    }

    /// Exits a critical region. Returns `None` if the thread was not inside one, and otherwise
    /// whether this was the outermost region.
    ///
    /// Must only be called by the owning thread.
    #[inline]
    pub(crate) fn exit(&self) -> Option<bool> {
        let depth = self.region.depth.load(Ordering::Relaxed);
        if depth == 0 {
            return None;
        }
        // Release: every read made inside the region happens before a scanner that observes the
        // thread outside of it.
        self.region.depth.store(depth - 1, Ordering::Release);
        Some(depth == 1)
    }

    #[inline]
    pub(crate) fn in_region(&self) -> bool {
        self.region.depth.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn observed_epoch(&self) -> Epoch {
        self.region.observed_epoch.load(Ordering::Relaxed)
    }

    /// Whether the thread cannot hold a reference obtained before the global epoch became `epoch`.
    #[inline]
    pub(crate) fn is_quiescent_at(&self, epoch: Epoch) -> bool {
        !self.in_region() || self.observed_epoch() == epoch
    }

    /// Marks the record for pruning. The owning thread must not touch the record afterwards.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// Singly-linked list of thread records, owned by the collector and guarded by its thread-list
/// lock.
#[derive(Debug)]
pub(crate) struct ThreadList {
    head: *mut ThreadData,
    len: usize,
}

// Records are only shared through `&ThreadData`, whose mutable state is atomic.
unsafe impl Send for ThreadList {}

impl ThreadList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Links `node` at the head of the list.
    pub(crate) fn push(&mut self, node: NonNull<ThreadData>) {
        unsafe { node.as_ref() }
            .next
            .store(self.head, Ordering::Relaxed);
        self.head = node.as_ptr();
        self.len += 1;
    }

    /// Unlinks every record for which `pred` holds and hands it to `free`. Returns the number of
    /// unlinked records.
    pub(crate) fn remove_if<P, F>(&mut self, mut pred: P, mut free: F) -> usize
    where
        P: FnMut(&ThreadData) -> bool,
        F: FnMut(NonNull<ThreadData>),
    {
        let mut removed = 0;
        let mut prev: *mut ThreadData = ptr::null_mut();
        let mut cur = self.head;
        while let Some(cur_ref) = unsafe { cur.as_ref() } {
            let next = cur_ref.next.load(Ordering::Relaxed);
            if pred(cur_ref) {
                match unsafe { prev.as_ref() } {
                    Some(prev_ref) => prev_ref.next.store(next, Ordering::Relaxed),
                    None => self.head = next,
                }
                self.len -= 1;
                removed += 1;
                free(unsafe { NonNull::new_unchecked(cur) });
            } else {
                prev = cur;
            }
            cur = next;
        }
        removed
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head,
            _marker: PhantomData,
        }
    }
}

pub(crate) struct Iter<'l> {
    cur: *const ThreadData,
    _marker: PhantomData<&'l ThreadData>,
}

impl<'l> Iterator for Iter<'l> {
    type Item = &'l ThreadData;

    fn next(&mut self) -> Option<Self::Item> {
        let cur_ref = unsafe { self.cur.as_ref() }?;
        self.cur = cur_ref.next.load(Ordering::Relaxed);
        Some(cur_ref)
    }
}
