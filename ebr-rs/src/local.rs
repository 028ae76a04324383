//! The calling thread's records, one per collector it has entered.
//!
//! Each registration keeps the collector's global state alive, so a record stays valid for as
//! long as the thread can reach it. When the thread exits, its remaining records are detached.

use core::cell::RefCell;
use core::ptr::NonNull;
use std::sync::Arc;
use std::thread_local;

use rustc_hash::FxHashMap;

use crate::collector::Global;
use crate::error::EbrError;
use crate::thread::ThreadData;

struct Registration {
    global: Arc<Global>,
    data: NonNull<ThreadData>,
}

#[derive(Default)]
struct Registry {
    records: FxHashMap<u64, Registration>,
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (_, registration) in self.records.drain() {
            let data = unsafe { registration.data.as_ref() };
            if data.in_region() {
                tracing::warn!(
                    target: "ebr",
                    collector = registration.global.id(),
                    "thread exited inside a critical region; the epoch can no longer advance"
                );
            }
            data.detach();
            // May drop the last handle on the collector.
            drop(registration.global);
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

/// Returns the calling thread's record in `global`, if it has one.
#[inline]
pub(crate) fn lookup(global: &Global) -> Option<NonNull<ThreadData>> {
    REGISTRY
        .try_with(|registry| {
            registry
                .borrow()
                .records
                .get(&global.id())
                .map(|registration| registration.data)
        })
        .ok()
        .flatten()
}

/// Returns the calling thread's record in `global`, registering the thread first if needed.
#[inline]
pub(crate) fn get_or_register(global: &Arc<Global>) -> Result<NonNull<ThreadData>, EbrError> {
    REGISTRY
        .try_with(|registry| {
            if let Some(registration) = registry.borrow().records.get(&global.id()) {
                return Ok(registration.data);
            }
            let data = global.register()?;
            registry.borrow_mut().records.insert(
                global.id(),
                Registration {
                    global: global.clone(),
                    data,
                },
            );
            Ok(data)
        })
        .map_err(|_| EbrError::ThreadExiting)?
}

/// Removes the calling thread's record in `global` from the registry and returns it.
///
/// The handle on the global state is dropped only after the registry is released, since dropping
/// the last one runs the collector's teardown.
pub(crate) fn unregister(global: &Global) -> Option<(Arc<Global>, NonNull<ThreadData>)> {
    REGISTRY
        .try_with(|registry| registry.borrow_mut().records.remove(&global.id()))
        .ok()
        .flatten()
        .map(|registration| (registration.global, registration.data))
}
