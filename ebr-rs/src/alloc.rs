//! Allocation of the collector's internal nodes.
//!
//! Every thread record and pending entry is allocated through a [`NodeAllocator`], so that
//! allocation failure is reported to the caller as [`EbrError::OutOfMemory`] instead of aborting
//! the process, and so that tests can inject failures.
//!
//! [`EbrError::OutOfMemory`]: crate::EbrError::OutOfMemory

use core::alloc::Layout;
use core::ptr::NonNull;
use std::alloc;

/// Allocator of the collector's internal nodes.
///
/// Layouts passed to this trait never have a zero size.
pub trait NodeAllocator: Send + Sync {
    /// Allocates a block of memory for `layout`, or returns `None` on failure.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Deallocates a block returned by [`allocate`](NodeAllocator::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` of the same allocator with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process-wide global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl NodeAllocator for SystemAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Moves `value` into a fresh node. Gives the value back if the allocation fails.
pub(crate) fn alloc_node<T>(allocator: &dyn NodeAllocator, value: T) -> Result<NonNull<T>, T> {
    let layout = Layout::new::<T>();
    match allocator.allocate(layout) {
        Some(ptr) => {
            let ptr = ptr.cast::<T>();
            unsafe { ptr.as_ptr().write(value) };
            Ok(ptr)
        }
        None => Err(value),
    }
}

/// Moves the value out of `node` and deallocates it.
///
/// # Safety
///
/// `node` must come from [`alloc_node`] with the same allocator and must not be used afterwards.
pub(crate) unsafe fn free_node<T>(allocator: &dyn NodeAllocator, node: NonNull<T>) -> T {
    let value = node.as_ptr().read();
    allocator.deallocate(node.cast(), Layout::new::<T>());
    value
}

#[cfg(test)]
mod tests {
    use super::{alloc_node, free_node, NodeAllocator, SystemAllocator};
    use core::alloc::Layout;
    use core::ptr::NonNull;

    struct Exhausted;

    impl NodeAllocator for Exhausted {
        fn allocate(&self, _: Layout) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
            unreachable!("nothing was ever allocated")
        }
    }

    #[test]
    fn node_roundtrip() {
        let node = alloc_node(&SystemAllocator, String::from("retired")).unwrap();
        let value = unsafe { free_node(&SystemAllocator, node) };
        assert_eq!(value, "retired");
    }

    #[test]
    fn failure_returns_value() {
        let value = alloc_node(&Exhausted, vec![1, 2, 3]).unwrap_err();
        assert_eq!(value, vec![1, 2, 3]);
    }
}
