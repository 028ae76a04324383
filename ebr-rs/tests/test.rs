use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering::*};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::scope;

use ebr_rs::*;

struct Tracked(&'static AtomicUsize);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Relaxed);
    }
}

/// Runs `clean_up_pending` until nothing is pending, giving up after `rounds` calls.
fn clean_up_within(collector: &Collector, rounds: usize) -> bool {
    for _ in 0..rounds {
        if collector.pending_count() == 0 {
            return true;
        }
        collector.clean_up_pending();
    }
    collector.pending_count() == 0
}

#[test]
fn counter() {
    const THREADS: usize = 4;
    const ITER: usize = 1024 * 16;

    let collector = Collector::new();
    let count = AtomicPtr::new(Box::into_raw(Box::new(0usize)));
    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITER {
                    let mut new = Box::new(0);
                    let guard = collector.enter().unwrap();
                    loop {
                        let cur_ptr = count.load(Acquire);
                        *new = unsafe { *cur_ptr } + 1;
                        let new_ptr = Box::into_raw(new);
                        if count
                            .compare_exchange(cur_ptr, new_ptr, AcqRel, Acquire)
                            .is_ok()
                        {
                            unsafe { guard.retire(cur_ptr) }.unwrap();
                            break;
                        } else {
                            new = unsafe { Box::from_raw(new_ptr) };
                        }
                    }
                    drop(guard);
                    if collector.clean_up_requested() {
                        collector.clean_up_pending();
                    }
                }
            });
        }
    });
    let cur = count.load(Acquire);
    // exclusive access
    assert_eq!(unsafe { *cur }, THREADS * ITER);
    drop(unsafe { Box::from_raw(cur) });
    assert!(clean_up_within(&collector, EBR_EPOCHS as usize));
    assert_eq!(collector.stats().reclaimed_entries, (THREADS * ITER) as u64);
}

const POISON: u64 = u64::MAX;

static POISONED: AtomicUsize = AtomicUsize::new(0);

/// Marks the cell as destroyed instead of freeing it, so that a premature deletion shows up as a
/// poisoned read rather than as undefined behavior.
unsafe fn poison(object: *mut u8) {
    (*(object as *const AtomicU64)).store(POISON, SeqCst);
    POISONED.fetch_add(1, Relaxed);
}

#[test]
fn readers_never_observe_deleted_objects() {
    const READERS: usize = 4;
    const WRITES: u64 = 1024 * 8;

    let collector = Collector::new();
    let shared = AtomicPtr::new(Box::into_raw(Box::new(AtomicU64::new(0))));
    let done = AtomicBool::new(false);

    scope(|s| {
        for _ in 0..READERS {
            s.spawn(|| {
                let mut last = 0;
                while !done.load(Acquire) {
                    let _guard = collector.enter().unwrap();
                    let cell = unsafe { &*shared.load(Acquire) };
                    for _ in 0..16 {
                        let value = cell.load(SeqCst);
                        assert_ne!(value, POISON, "read an object after its deletion");
                        assert!(value >= last);
                        last = value;
                    }
                }
            });
        }

        s.spawn(|| {
            for i in 1..=WRITES {
                {
                    let guard = collector.enter().unwrap();
                    let new = Box::into_raw(Box::new(AtomicU64::new(i)));
                    let old = shared.swap(new, AcqRel);
                    unsafe { guard.queue_for_deletion(old.cast(), poison, 8) }.unwrap();
                }
                if i % 8 == 0 {
                    collector.clean_up_pending();
                }
            }
            done.store(true, Release);
        });
    });

    assert!(clean_up_within(&collector, EBR_EPOCHS as usize));
    assert_eq!(POISONED.load(Relaxed), WRITES as usize);
    assert_eq!(collector.pending_size_in_bytes(), 0);
    // The poisoned cells are intentionally leaked.
    drop(unsafe { Box::from_raw(shared.load(Relaxed)) });
}

#[test]
fn queued_objects_are_reclaimed_within_three_clean_ups() {
    const OBJECTS: usize = 100;
    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    let collector = Collector::new();
    {
        let _guard = collector.enter().unwrap();
        for _ in 0..OBJECTS {
            unsafe { collector.retire(Box::into_raw(Box::new(Tracked(&DROPPED)))) }.unwrap();
        }
    }
    assert_eq!(collector.pending_count(), OBJECTS);
    assert!(collector.clean_up_requested());

    let mut reclaimed = 0;
    for _ in 0..EBR_EPOCHS {
        reclaimed += collector.clean_up_pending();
    }
    assert_eq!(reclaimed, OBJECTS);
    assert_eq!(DROPPED.load(Relaxed), OBJECTS);
    assert_eq!(collector.pending_size_in_bytes(), 0);
    assert!(!collector.clean_up_requested());
}

#[test]
fn nested_regions_keep_the_outermost_snapshot() {
    let collector = Collector::new();
    let entered_at = collector.global_epoch();

    let outer = collector.enter().unwrap();
    assert_eq!(collector.observed_epoch(), Some(entered_at));

    // The thread has observed the current epoch, so exactly one advance goes through.
    collector.clean_up_pending();
    assert_eq!(collector.global_epoch(), entered_at.successor());

    let inner = collector.enter().unwrap();
    assert_eq!(collector.observed_epoch(), Some(entered_at));
    collector.clean_up_pending();
    assert_eq!(collector.global_epoch(), entered_at.successor());

    drop(inner);
    assert!(collector.in_critical_region());
    collector.clean_up_pending();
    assert_eq!(collector.global_epoch(), entered_at.successor());

    drop(outer);
    assert!(!collector.in_critical_region());
    assert_eq!(collector.observed_epoch(), None);
    collector.clean_up_pending();
    assert_eq!(collector.global_epoch(), entered_at.successor().successor());
}

#[derive(Default)]
struct CountingReclaimer {
    calls: AtomicUsize,
    depth: AtomicUsize,
}

impl Reclaimer for CountingReclaimer {
    fn enter_critical_region(&self) -> Result<(), EbrError> {
        self.calls.fetch_add(1, Relaxed);
        self.depth.fetch_add(1, Relaxed);
        Ok(())
    }

    fn exit_critical_region(&self) -> Result<(), EbrError> {
        self.calls.fetch_add(1, Relaxed);
        self.depth.fetch_sub(1, Relaxed);
        Ok(())
    }

    fn in_critical_region(&self) -> bool {
        self.calls.fetch_add(1, Relaxed);
        self.depth.load(Relaxed) > 0
    }

    unsafe fn queue_for_deletion(
        &self,
        _: *mut u8,
        _: Deleter,
        _: usize,
    ) -> Result<(), EbrError> {
        self.calls.fetch_add(1, Relaxed);
        Ok(())
    }

    fn thread_detach(&self) -> bool {
        self.calls.fetch_add(1, Relaxed);
        false
    }

    fn clean_up_requested(&self) -> bool {
        self.calls.fetch_add(1, Relaxed);
        false
    }

    fn clean_up_pending(&self) -> usize {
        self.calls.fetch_add(1, Relaxed);
        0
    }
}

unsafe fn never_called(_: *mut u8) {
    unreachable!("nothing is queued through a disabled holder")
}

#[test]
fn disabled_holder_is_a_no_op() {
    let reclaimer = CountingReclaimer::default();
    {
        let holder = CriticalRegionHolder::new(&reclaimer, false).unwrap();
        assert!(!holder.is_enabled());
        assert!(holder.reclaimer().is_none());
        let mut object = 0u8;
        assert_eq!(
            unsafe { holder.queue_for_deletion(&mut object, never_called, 1) },
            Err(EbrError::NotInCriticalRegion)
        );
    }
    assert_eq!(reclaimer.calls.load(Relaxed), 0);

    {
        let _holder = CriticalRegionHolder::new(&reclaimer, true).unwrap();
        assert_eq!(reclaimer.depth.load(Relaxed), 1);
    }
    assert_eq!(reclaimer.depth.load(Relaxed), 0);
    assert_eq!(reclaimer.calls.load(Relaxed), 2);
}

#[test]
fn stalled_reader_blocks_reclamation() {
    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    let collector = &Collector::new();
    let stalled_at = collector.global_epoch();
    let (queued_tx, queued_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    scope(|s| {
        s.spawn(move || {
            let guard = collector.enter().unwrap();
            unsafe { guard.retire(Box::into_raw(Box::new(Tracked(&DROPPED)))) }.unwrap();
            queued_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            drop(guard);
            queued_tx.send(()).unwrap();
        });

        queued_rx.recv().unwrap();
        // The stalled reader has observed the current epoch, which lets exactly one advance
        // through. From then on the epoch stays put.
        collector.clean_up_pending();
        let blocked_at = collector.global_epoch();
        assert_eq!(blocked_at, stalled_at.successor());
        for _ in 0..16 {
            assert_eq!(collector.clean_up_pending(), 0);
            assert_eq!(collector.global_epoch(), blocked_at);
        }
        assert_eq!(collector.stats().epoch_advances, 1);
        assert_eq!(DROPPED.load(Relaxed), 0);
        assert_eq!(collector.pending_count(), 1);

        resume_tx.send(()).unwrap();
        queued_rx.recv().unwrap();
        assert!(clean_up_within(collector, EBR_EPOCHS as usize));
        assert_eq!(DROPPED.load(Relaxed), 1);
    });
}

#[test]
fn stalled_reader_lets_garbage_pile_up() {
    const ROUNDS: usize = 64;
    const PER_ROUND: usize = 256;
    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    let collector = &Collector::with_config(Config::default().memory_budget_bytes(1024));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    scope(|s| {
        let reader = s.spawn(move || {
            let guard = collector.enter().unwrap();
            entered_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            drop(guard);
        });
        entered_rx.recv().unwrap();

        let mut last_bytes = 0;
        for round in 1..=ROUNDS {
            let guard = collector.enter().unwrap();
            for _ in 0..PER_ROUND {
                unsafe { guard.retire(Box::into_raw(Box::new(Tracked(&DROPPED)))) }.unwrap();
            }
            drop(guard);
            assert_eq!(collector.clean_up_pending(), 0);

            // Nothing is ever destroyed while the reader sits in its region, however much
            // garbage the writer produces.
            assert_eq!(collector.pending_count(), round * PER_ROUND);
            let bytes = collector.pending_size_in_bytes();
            assert!(bytes > last_bytes);
            last_bytes = bytes;
            assert!(collector.clean_up_requested());
            assert_eq!(DROPPED.load(Relaxed), 0);
        }
        assert!(collector.stats().epoch_advances <= 1);

        resume_tx.send(()).unwrap();
        reader.join().unwrap();
        assert!(clean_up_within(collector, EBR_EPOCHS as usize));
        assert_eq!(DROPPED.load(Relaxed), ROUNDS * PER_ROUND);
        assert_eq!(collector.pending_size_in_bytes(), 0);
        assert!(!collector.clean_up_requested());
    });
}

#[test]
fn objects_queued_by_one_thread_are_reclaimed_by_another() {
    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    let collector = Collector::new();
    scope(|s| {
        s.spawn(|| {
            let guard = collector.enter().unwrap();
            unsafe { guard.retire(Box::into_raw(Box::new(Tracked(&DROPPED)))) }.unwrap();
        })
        .join()
        .unwrap();

        assert!(collector.clean_up_requested());
        s.spawn(|| {
            for _ in 0..EBR_EPOCHS {
                collector.clean_up_pending();
            }
        })
        .join()
        .unwrap();
    });
    assert_eq!(DROPPED.load(Relaxed), 1);
    assert_eq!(collector.pending_size_in_bytes(), 0);
    assert!(!collector.clean_up_requested());
}

#[test]
fn concurrent_retire_and_clean_up() {
    const THREADS: usize = 8;
    const ITER: usize = 1024 * 4;
    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    let collector = Collector::with_config(Config::default().memory_budget_bytes(1024));
    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITER {
                    {
                        let guard = collector.enter().unwrap();
                        unsafe { guard.retire(Box::into_raw(Box::new(Tracked(&DROPPED)))) }
                            .unwrap();
                    }
                    if collector.clean_up_requested() {
                        collector.clean_up_pending();
                    }
                }
                collector.thread_detach();
            });
        }
    });
    assert!(clean_up_within(&collector, EBR_EPOCHS as usize));
    assert_eq!(DROPPED.load(Relaxed), THREADS * ITER);
}

/// Hands out `budget` allocations, then fails.
struct FailingAllocator {
    budget: AtomicUsize,
}

impl FailingAllocator {
    fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            budget: AtomicUsize::new(budget),
        })
    }
}

impl NodeAllocator for FailingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.budget
            .fetch_update(Relaxed, Relaxed, |budget| budget.checked_sub(1))
            .ok()?;
        SystemAllocator.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        SystemAllocator.deallocate(ptr, layout)
    }
}

#[test]
fn enter_reports_out_of_memory() {
    let collector = Collector::with_config(Config::default().allocator(FailingAllocator::new(0)));
    assert!(matches!(
        collector.enter(),
        Err(EbrError::OutOfMemory { .. })
    ));
    assert!(!collector.in_critical_region());
    assert_eq!(collector.stats().registered_threads, 0);
}

static FAILED_DELETES: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_delete(object: *mut u8) {
    FAILED_DELETES.fetch_add(1, Relaxed);
    drop(Box::from_raw(object));
}

#[test]
fn failed_queue_leaves_object_with_caller() {
    // Enough for the thread record only.
    let collector = Collector::with_config(Config::default().allocator(FailingAllocator::new(1)));
    let guard = collector.enter().unwrap();

    let object = Box::into_raw(Box::new(42u8));
    assert!(matches!(
        unsafe { guard.queue_for_deletion(object, count_delete, 1) },
        Err(EbrError::OutOfMemory { .. })
    ));
    assert_eq!(collector.pending_count(), 0);
    assert_eq!(collector.pending_size_in_bytes(), 0);
    drop(guard);

    for _ in 0..EBR_EPOCHS {
        collector.clean_up_pending();
    }
    assert_eq!(FAILED_DELETES.load(Relaxed), 0);
    // Still ours.
    assert_eq!(unsafe { *object }, 42);
    drop(unsafe { Box::from_raw(object) });
}

#[test]
fn invalid_queue_requests() {
    let collector = Collector::new();
    let object = Box::into_raw(Box::new(0u32));

    assert_eq!(
        unsafe { collector.retire(object) },
        Err(EbrError::NotInCriticalRegion)
    );
    {
        let guard = collector.enter().unwrap();
        assert_eq!(
            unsafe { guard.queue_for_deletion(ptr::null_mut(), count_delete, 1) },
            Err(EbrError::NullObject)
        );
    }
    assert_eq!(collector.pending_count(), 0);
    drop(unsafe { Box::from_raw(object) });
}
