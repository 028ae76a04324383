//! Epoch-based reclamation (EBR).
//!
//! Frees memory of concurrently-read data structures without locks or allocation on the read
//! path. Readers and writers wrap accesses to a shared structure in a critical region; a writer
//! that unlinks an object queues it for deletion; and some thread opportunistically calls
//! [`Collector::clean_up_pending`], which advances the global epoch once every thread inside a
//! critical region has observed the current one and then destroys the objects retired two epochs
//! earlier.
//!
//! ```
//! use core::sync::atomic::{AtomicPtr, Ordering};
//! use ebr_rs::Collector;
//!
//! let collector = Collector::new();
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(1u64)));
//!
//! {
//!     let guard = collector.enter().unwrap();
//!     let old = shared.swap(Box::into_raw(Box::new(2u64)), Ordering::AcqRel);
//!     unsafe { guard.retire(old) }.unwrap();
//! }
//!
//! while collector.pending_count() > 0 {
//!     collector.clean_up_pending();
//! }
//! # drop(unsafe { Box::from_raw(shared.load(Ordering::Relaxed)) });
//! ```
//!
//! The collector does not support clean teardown by default: objects still pending when the last
//! handle is dropped are leaked (see [`Config::drain_on_drop`] and [`Collector::force_drain`]).

mod alloc;
mod collector;
mod epoch;
mod error;
mod holder;
mod local;
mod pending;
mod reclaimer;
mod thread;

pub use alloc::{NodeAllocator, SystemAllocator};
pub use collector::{Collector, CollectorStats, Config};
pub use epoch::{Epoch, EBR_EPOCHS};
pub use error::EbrError;
pub use holder::CriticalRegionHolder;
pub use pending::Deleter;
pub use reclaimer::Reclaimer;
