//! The collector: global epoch, thread records and pending-deletion queues.

use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::alloc::{alloc_node, free_node, NodeAllocator, SystemAllocator};
use crate::epoch::{AtomicEpoch, Epoch, EBR_EPOCHS};
use crate::error::EbrError;
use crate::holder::CriticalRegionHolder;
use crate::local;
use crate::pending::{drop_box, Deleter, DetachedQueue, PendingEntry, PendingQueues, Retired};
use crate::thread::{ThreadData, ThreadList};

/// Identifies collectors in the per-thread registries. Never reused.
static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(0);

/// Configuration of a [`Collector`].
#[derive(Clone)]
pub struct Config {
    /// [`Collector::clean_up_requested`] reports `true` once more than this many bytes are
    /// pending.
    pub memory_budget_bytes: usize,
    /// Run every pending deleter when the collector is torn down.
    ///
    /// The collector is meant to live until the process exits, and by default pending objects are
    /// simply leaked when the last handle goes away. Embedders that need deterministic teardown
    /// (e.g. under a leak checker) can opt into draining instead.
    pub drain_on_drop: bool,
    /// Allocator of thread records and pending entries.
    pub allocator: Arc<dyn NodeAllocator>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 0,
            drain_on_drop: false,
            allocator: Arc::new(SystemAllocator),
        }
    }
}

impl Config {
    pub fn memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn drain_on_drop(mut self, drain: bool) -> Self {
        self.drain_on_drop = drain;
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn NodeAllocator>) -> Self {
        self.allocator = allocator;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("memory_budget_bytes", &self.memory_budget_bytes)
            .field("drain_on_drop", &self.drain_on_drop)
            .finish_non_exhaustive()
    }
}

/// A point-in-time snapshot of a collector's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub global_epoch: Epoch,
    pub pending_bytes: usize,
    pub pending_entries: usize,
    pub registered_threads: usize,
    pub epoch_advances: u64,
    pub reclaimed_entries: u64,
    pub pruned_threads: u64,
}

/// The global data of a collector.
///
/// Lock order: `threads` is never held while acquiring `pending` and vice versa.
pub(crate) struct Global {
    id: u64,
    epoch: CachePadded<AtomicEpoch>,
    threads: Mutex<ThreadList>,
    pending: Mutex<PendingQueues>,
    pending_bytes: CachePadded<AtomicUsize>,
    pending_entries: AtomicUsize,
    epoch_advances: AtomicU64,
    reclaimed_entries: AtomicU64,
    pruned_threads: AtomicU64,
    config: Config,
}

impl Global {
    fn new(config: Config) -> Self {
        Self {
            id: NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed),
            epoch: CachePadded::new(AtomicEpoch::new(Epoch::starting())),
            threads: Mutex::new(ThreadList::new()),
            pending: Mutex::new(PendingQueues::new()),
            pending_bytes: CachePadded::new(AtomicUsize::new(0)),
            pending_entries: AtomicUsize::new(0),
            epoch_advances: AtomicU64::new(0),
            reclaimed_entries: AtomicU64::new(0),
            pruned_threads: AtomicU64::new(0),
            config,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    fn allocator(&self) -> &dyn NodeAllocator {
        &*self.config.allocator
    }

    /// Allocates a record for the calling thread and links it into the thread list.
    pub(crate) fn register(&self) -> Result<NonNull<ThreadData>, EbrError> {
        let data = alloc_node(self.allocator(), ThreadData::new()).map_err(|_| {
            tracing::warn!(target: "ebr", collector = self.id, "failed to allocate a thread record");
            EbrError::OutOfMemory {
                what: "thread record",
            }
        })?;
        let mut threads = self.threads.lock();
        threads.push(data);
        tracing::debug!(
            target: "ebr",
            collector = self.id,
            threads = threads.len(),
            "registered thread"
        );
        Ok(data)
    }

    /// Prunes detached records, then checks whether every thread inside a critical region has
    /// observed `epoch`.
    fn can_advance_epoch(&self, threads: &mut ThreadList, epoch: Epoch) -> bool {
        let allocator = self.allocator();
        let pruned = threads.remove_if(
            |data| data.is_detached() && !data.in_region(),
            |data| drop(unsafe { free_node(allocator, data) }),
        );
        if pruned > 0 {
            self.pruned_threads
                .fetch_add(pruned as u64, Ordering::Relaxed);
            tracing::debug!(target: "ebr", collector = self.id, pruned, "pruned detached threads");
        }

        threads.iter().all(|data| data.is_quiescent_at(epoch))
    }

    /// Advances the global epoch if no thread lags behind it. Returns the new epoch.
    fn try_advance_epoch(&self) -> Option<Epoch> {
        let mut threads = self.threads.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        // Pairs with the fence in `ThreadData::enter`.
        fence(Ordering::SeqCst);

        if !self.can_advance_epoch(&mut threads, epoch) {
            tracing::trace!(target: "ebr", collector = self.id, %epoch, "epoch advance blocked");
            return None;
        }

        let next = epoch.successor();
        self.epoch
            .compare_exchange(epoch, next, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        self.epoch_advances.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "ebr", collector = self.id, epoch = %next, "advanced epoch");
        Some(next)
    }

    /// Runs the deleters of `queue`. Returns how many objects were destroyed.
    ///
    /// # Safety
    ///
    /// No thread may still reference the objects of `queue`.
    unsafe fn reclaim(&self, queue: DetachedQueue) -> usize {
        let mut count = 0;
        for retired in queue.drain(self.allocator()) {
            self.pending_bytes.fetch_sub(retired.size, Ordering::Relaxed);
            self.pending_entries.fetch_sub(1, Ordering::Relaxed);
            retired.delete();
            count += 1;
        }
        if count > 0 {
            self.reclaimed_entries
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    fn detach_all(&self) -> Vec<DetachedQueue> {
        let mut pending = self.pending.lock();
        let mut epoch = Epoch::starting();
        let mut queues = Vec::with_capacity(EBR_EPOCHS as usize);
        for _ in 0..EBR_EPOCHS {
            queues.push(pending.detach(epoch));
            epoch = epoch.successor();
        }
        queues
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        // No thread holds a registration anymore, hence none is inside a critical region.
        let queues = self.detach_all();
        if self.config.drain_on_drop {
            let drained: usize = queues
                .into_iter()
                .map(|queue| unsafe { self.reclaim(queue) })
                .sum();
            tracing::debug!(target: "ebr", collector = self.id, drained, "drained collector");
        } else {
            let mut leaked = 0;
            for queue in queues {
                leaked += unsafe { queue.drain(self.allocator()) }.count();
            }
            if leaked > 0 {
                tracing::debug!(
                    target: "ebr",
                    collector = self.id,
                    leaked,
                    "collector torn down with pending objects"
                );
            }
        }

        let allocator = &*self.config.allocator;
        self.threads
            .get_mut()
            .remove_if(|_| true, |data| drop(unsafe { free_node(allocator, data) }));
    }
}

/// An epoch-based reclamation collector.
///
/// Construction initializes the collector; there is no separate initialization step. Cloning
/// yields another handle on the same collector. Pending objects are leaked when the last handle
/// is dropped unless [`Config::drain_on_drop`] is set: the collector is intended to be created
/// once at startup and to live until the process exits.
pub struct Collector {
    pub(crate) global: Arc<Global>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    /// Creates a new collector with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a new collector.
    pub fn with_config(config: Config) -> Self {
        Self {
            global: Arc::new(Global::new(config)),
        }
    }

    /// Enters a critical region and returns a holder that exits it when dropped.
    #[inline]
    pub fn enter(&self) -> Result<CriticalRegionHolder<'_, Self>, EbrError> {
        CriticalRegionHolder::new(self, true)
    }

    /// Enters a critical region on the calling thread.
    ///
    /// Regions nest; only the outermost entry snapshots the global epoch. The first entry of a
    /// thread allocates its record, which is the only way this can fail. Prefer [`enter`], which
    /// guarantees the region is exited on every path.
    ///
    /// [`enter`]: Collector::enter
    #[inline]
    pub fn enter_critical_region(&self) -> Result<(), EbrError> {
        let data = local::get_or_register(&self.global)?;
        unsafe { data.as_ref() }.enter(&self.global.epoch);
        Ok(())
    }

    /// Exits a critical region on the calling thread.
    ///
    /// Never reclaims anything by itself; see [`clean_up_pending`](Collector::clean_up_pending).
    #[inline]
    pub fn exit_critical_region(&self) -> Result<(), EbrError> {
        let data = local::lookup(&self.global).ok_or(EbrError::UnbalancedExit)?;
        unsafe { data.as_ref() }
            .exit()
            .map(|_| ())
            .ok_or(EbrError::UnbalancedExit)
    }

    /// Returns `true` if the calling thread is inside a critical region of this collector.
    #[inline]
    pub fn in_critical_region(&self) -> bool {
        local::lookup(&self.global).is_some_and(|data| unsafe { data.as_ref() }.in_region())
    }

    /// Returns the epoch the calling thread observed when it entered its outermost critical
    /// region, or `None` if it is not inside one.
    pub fn observed_epoch(&self) -> Option<Epoch> {
        let data = local::lookup(&self.global)?;
        let data = unsafe { data.as_ref() };
        data.in_region().then(|| data.observed_epoch())
    }

    /// Queues `object` to be destroyed by `deleter` once no thread can still reference it.
    ///
    /// On success the collector owns the object and eventually calls `deleter(object)` exactly
    /// once, on an arbitrary thread. **On failure nothing is queued and nothing is deleted: the
    /// object remains the caller's responsibility**, and ignoring the error leaks it.
    ///
    /// # Errors
    ///
    /// * [`EbrError::NotInCriticalRegion`] if the calling thread is not inside a critical region
    ///   of this collector.
    /// * [`EbrError::NullObject`] if `object` is null.
    /// * [`EbrError::OutOfMemory`] if the pending entry cannot be allocated.
    ///
    /// # Safety
    ///
    /// * `object` must already be unreachable for threads entering a critical region from now
    ///   on (e.g. unlinked from the shared structure).
    /// * `deleter(object)` must be sound to call once, from any thread.
    pub unsafe fn queue_for_deletion(
        &self,
        object: *mut u8,
        deleter: Deleter,
        estimated_size: usize,
    ) -> Result<(), EbrError> {
        let object = NonNull::new(object).ok_or(EbrError::NullObject)?;
        if !self.in_critical_region() {
            return Err(EbrError::NotInCriticalRegion);
        }

        let retired = Retired {
            object,
            deleter,
            size: estimated_size,
        };
        let entry = alloc_node(self.global.allocator(), PendingEntry::new(retired)).map_err(|_| {
            tracing::warn!(
                target: "ebr",
                collector = self.global.id,
                "failed to allocate a pending entry; the object was not queued"
            );
            EbrError::OutOfMemory {
                what: "pending entry",
            }
        })?;

        let mut pending = self.global.pending.lock();
        self.global
            .pending_bytes
            .fetch_add(estimated_size, Ordering::Relaxed);
        self.global.pending_entries.fetch_add(1, Ordering::Relaxed);
        let epoch = self.global.epoch.load(Ordering::Acquire);
        pending.push(epoch, entry);
        Ok(())
    }

    /// Queues a boxed `T` to be dropped once no thread can still reference it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`, and the requirements of
    /// [`queue_for_deletion`](Collector::queue_for_deletion) apply.
    pub unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) -> Result<(), EbrError> {
        self.queue_for_deletion(ptr as *mut u8, drop_box::<T>, mem::size_of::<T>())
    }

    /// Marks the calling thread's record for deferred cleanup. Returns `false` if the thread had
    /// no record.
    ///
    /// The record is unlinked and freed by a later [`clean_up_pending`] once it is outside any
    /// critical region. Threads are also detached automatically when they exit.
    ///
    /// [`clean_up_pending`]: Collector::clean_up_pending
    pub fn thread_detach(&self) -> bool {
        let Some((global, data)) = local::unregister(&self.global) else {
            return false;
        };
        let data = unsafe { data.as_ref() };
        if data.in_region() {
            tracing::warn!(
                target: "ebr",
                collector = self.global.id,
                "thread detached inside a critical region; the epoch can no longer advance"
            );
        }
        data.detach();
        drop(global);
        true
    }

    /// Cheap check of whether [`clean_up_pending`](Collector::clean_up_pending) is worth calling,
    /// i.e. whether the pending bytes exceed the memory budget.
    #[inline]
    pub fn clean_up_requested(&self) -> bool {
        self.global.pending_bytes.load(Ordering::Relaxed) > self.global.config.memory_budget_bytes
    }

    /// Tries to advance the global epoch, and on success destroys the objects that became
    /// unreachable. Returns how many objects were destroyed.
    ///
    /// Never waits for other threads: if some thread inside a critical region has not observed
    /// the current epoch yet, this returns `0` right away.
    pub fn clean_up_pending(&self) -> usize {
        let Some(epoch) = self.global.try_advance_epoch() else {
            return 0;
        };
        let queue = {
            let mut pending = self.global.pending.lock();
            // Once the epoch moves on again, the reclaimable slot starts receiving fresh
            // retirements. Its older entries are left for the cleaner of a later advance.
            if self.global.epoch.load(Ordering::Acquire) != epoch {
                tracing::trace!(target: "ebr", collector = self.global.id, %epoch, "slot recycled");
                return 0;
            }
            pending.detach(epoch.reclaimable())
        };
        let reclaimed = unsafe { self.global.reclaim(queue) };
        if reclaimed > 0 {
            tracing::debug!(
                target: "ebr",
                collector = self.global.id,
                slot = %epoch.reclaimable(),
                reclaimed,
                "reclaimed pending objects"
            );
        }
        reclaimed
    }

    /// Destroys every pending object regardless of epoch safety. Returns how many objects were
    /// destroyed.
    ///
    /// This is the explicit shutdown path for embedders that must tear down deterministically.
    ///
    /// # Safety
    ///
    /// No thread may access an object protected by this collector, neither now nor concurrently
    /// with this call.
    pub unsafe fn force_drain(&self) -> usize {
        let drained = self
            .global
            .detach_all()
            .into_iter()
            .map(|queue| self.global.reclaim(queue))
            .sum();
        tracing::warn!(
            target: "ebr",
            collector = self.global.id,
            drained,
            "force-drained pending objects"
        );
        drained
    }

    /// Reads the global epoch.
    #[inline]
    pub fn global_epoch(&self) -> Epoch {
        self.global.epoch.load(Ordering::Acquire)
    }

    /// Returns the estimated size of the objects not reclaimed yet.
    #[inline]
    pub fn pending_size_in_bytes(&self) -> usize {
        self.global.pending_bytes.load(Ordering::Relaxed)
    }

    /// Returns the number of objects not reclaimed yet.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.global.pending_entries.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CollectorStats {
        let global = &*self.global;
        CollectorStats {
            global_epoch: self.global_epoch(),
            pending_bytes: self.pending_size_in_bytes(),
            pending_entries: self.pending_count(),
            registered_threads: global.threads.lock().len(),
            epoch_advances: global.epoch_advances.load(Ordering::Relaxed),
            reclaimed_entries: global.reclaimed_entries.load(Ordering::Relaxed),
            pruned_threads: global.pruned_threads.load(Ordering::Relaxed),
        }
    }
}

impl Clone for Collector {
    /// Creates another reference to the same collector.
    fn clone(&self) -> Self {
        Collector {
            global: self.global.clone(),
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Collector { .. }")
    }
}

impl PartialEq for Collector {
    /// Checks if both handles point to the same collector.
    fn eq(&self, rhs: &Collector) -> bool {
        Arc::ptr_eq(&self.global, &rhs.global)
    }
}
impl Eq for Collector {}
