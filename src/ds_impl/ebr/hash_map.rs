//! A resizable hash map with lock-free readers and serialized writers.
//!
//! Readers walk immutable bucket chains inside a critical region. Writers take the writer lock and
//! never modify a published node: a removal copies the chain prefix in front of the removed node,
//! and a resize copies the whole table. Whatever becomes unreachable is retired to the collector.

use super::concurrent_map::{ConcurrentMap, OutputHolder};
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ebr_rs::{Collector, CriticalRegionHolder};
use parking_lot::Mutex;

/// Average chain length above which the table doubles.
const MAX_LOAD_FACTOR: usize = 2;

const DEFAULT_BUCKETS: usize = 1024;

struct Node<K, V> {
    key: K,
    value: V,
    /// Written once, before the node is published.
    next: AtomicPtr<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V, next: *mut Node<K, V>) -> Self {
        Self {
            key,
            value,
            next: AtomicPtr::new(next),
        }
    }
}

/// A bucket array. Owns every node reachable from its buckets.
struct Table<K, V> {
    buckets: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn with_buckets(n: usize) -> Self {
        debug_assert!(n.is_power_of_two());
        Self {
            buckets: (0..n).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    #[inline]
    fn bucket(&self, hash: usize) -> &AtomicPtr<Node<K, V>> {
        unsafe { self.buckets.get_unchecked(hash & (self.buckets.len() - 1)) }
    }
}

impl<K: Eq, V> Table<K, V> {
    /// Walks the chain starting at `head` looking for `key`.
    #[inline]
    fn find<'g>(head: *mut Node<K, V>, key: &K) -> Option<&'g Node<K, V>> {
        let mut cur = head;
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.key == *key {
                return Some(node);
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut cur = bucket.load(Ordering::Relaxed);
            while !cur.is_null() {
                let node = unsafe { Box::from_raw(cur) };
                cur = node.next.load(Ordering::Relaxed);
            }
        }
    }
}

pub struct HashMap<K, V> {
    table: AtomicPtr<Table<K, V>>,
    writer: Mutex<()>,
    len: AtomicUsize,
    collector: Collector,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> HashMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn with_capacity(collector: &Collector, n: usize) -> Self {
        let table = Table::with_buckets(n.max(1).next_power_of_two());
        HashMap {
            table: AtomicPtr::new(Box::into_raw(Box::new(table))),
            writer: Mutex::new(()),
            len: AtomicUsize::new(0),
            collector: collector.clone(),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn hash(k: &K) -> usize {
        let mut s = DefaultHasher::new();
        k.hash(&mut s);
        s.finish() as usize
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of buckets.
    pub fn buckets(&self, guard: &CriticalRegionHolder<'_>) -> usize {
        self.check_guard(guard);
        unsafe { &*self.table.load(Ordering::Acquire) }.buckets.len()
    }

    /// Panics unless `guard` keeps the calling thread inside a critical region of this map's
    /// collector. References handed out under any other holder could outlive their node.
    #[inline]
    fn check_guard(&self, guard: &CriticalRegionHolder<'_>) {
        assert!(
            guard.reclaimer() == Some(&self.collector) && self.collector.in_critical_region(),
            "the holder does not protect this map"
        );
    }

    /// Hands an unlinked object over to the collector.
    ///
    /// If the collector cannot take it, the object is leaked: some reader may still hold it.
    fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        if let Err(err) = unsafe { self.collector.retire(ptr) } {
            tracing::warn!(%err, "failed to retire an unlinked object, leaking it");
        }
    }

    pub fn get<'g>(&'g self, key: &K, guard: &'g CriticalRegionHolder<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let head = table.bucket(Self::hash(key)).load(Ordering::Acquire);
        Table::find(head, key).map(|node| &node.value)
    }

    pub fn insert(&self, key: K, value: V, guard: &CriticalRegionHolder<'_>) -> bool {
        self.check_guard(guard);
        let _writer = self.writer.lock();
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let bucket = table.bucket(Self::hash(&key));
        let head = bucket.load(Ordering::Relaxed);
        if Table::find(head, &key).is_some() {
            return false;
        }

        let node = Box::into_raw(Box::new(Node::new(key, value, head)));
        bucket.store(node, Ordering::Release);
        let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
        if len > table.buckets.len() * MAX_LOAD_FACTOR {
            self.grow(table);
        }
        true
    }

    pub fn remove<'g>(&'g self, key: &K, guard: &'g CriticalRegionHolder<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        let _writer = self.writer.lock();
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let bucket = table.bucket(Self::hash(key));

        let mut prefix = Vec::new();
        let mut cur = bucket.load(Ordering::Relaxed);
        let target = loop {
            let node = unsafe { cur.as_ref() }?;
            if node.key == *key {
                break cur;
            }
            prefix.push(cur);
            cur = node.next.load(Ordering::Relaxed);
        };
        let target_ref: &'g Node<K, V> = unsafe { &*target };

        // Readers may be anywhere in the old chain, so its prefix is replaced rather than relinked.
        let mut next = target_ref.next.load(Ordering::Relaxed);
        for &old in prefix.iter().rev() {
            let old = unsafe { &*old };
            next = Box::into_raw(Box::new(Node::new(old.key.clone(), old.value.clone(), next)));
        }
        bucket.store(next, Ordering::Release);
        self.len.fetch_sub(1, Ordering::Relaxed);

        for old in prefix {
            self.retire(old);
        }
        self.retire(target);
        Some(&target_ref.value)
    }

    /// Replaces `table` with a copy twice its size. Must be called with the writer lock held.
    fn grow(&self, table: &Table<K, V>) {
        let new = Table::with_buckets(table.buckets.len() * 2);
        for bucket in table.buckets.iter() {
            let mut cur = bucket.load(Ordering::Relaxed);
            while let Some(node) = unsafe { cur.as_ref() } {
                let slot = new.bucket(Self::hash(&node.key));
                let head = slot.load(Ordering::Relaxed);
                let copy = Node::new(node.key.clone(), node.value.clone(), head);
                slot.store(Box::into_raw(Box::new(copy)), Ordering::Relaxed);
                cur = node.next.load(Ordering::Relaxed);
            }
        }

        let buckets = new.buckets.len();
        let old = self
            .table
            .swap(Box::into_raw(Box::new(new)), Ordering::AcqRel);
        tracing::debug!(buckets, len = self.len(), "grew hash map");
        self.retire(old);
    }
}

impl<K, V> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(*self.table.get_mut()) });
    }
}

impl<K, V> ConcurrentMap<K, V> for HashMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn new(collector: &Collector) -> Self {
        Self::with_capacity(collector, DEFAULT_BUCKETS)
    }

    #[inline(always)]
    fn get<'g>(
        &'g self,
        key: &'g K,
        guard: &'g CriticalRegionHolder<'_>,
    ) -> Option<impl OutputHolder<V>> {
        self.get(key, guard)
    }

    #[inline(always)]
    fn insert(&self, key: K, value: V, guard: &CriticalRegionHolder<'_>) -> bool {
        self.insert(key, value, guard)
    }

    #[inline(always)]
    fn remove<'g>(
        &'g self,
        key: &'g K,
        guard: &'g CriticalRegionHolder<'_>,
    ) -> Option<impl OutputHolder<V>> {
        self.remove(key, guard)
    }
}
