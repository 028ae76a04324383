use ebr_rs::{Collector, CriticalRegionHolder};

pub trait OutputHolder<V> {
    fn output(&self) -> &V;
}

impl<'g, V> OutputHolder<V> for &'g V {
    fn output(&self) -> &V {
        self
    }
}

impl<V> OutputHolder<V> for V {
    fn output(&self) -> &V {
        self
    }
}

/// A map whose unlinked memory is reclaimed through `collector`.
///
/// Every operation takes a holder of a critical region of that collector, which bounds the
/// lifetime of the references it returns.
pub trait ConcurrentMap<K, V> {
    fn new(collector: &Collector) -> Self;
    fn get<'g>(
        &'g self,
        key: &'g K,
        guard: &'g CriticalRegionHolder<'_>,
    ) -> Option<impl OutputHolder<V>>;
    fn insert(&self, key: K, value: V, guard: &CriticalRegionHolder<'_>) -> bool;
    fn remove<'g>(
        &'g self,
        key: &'g K,
        guard: &'g CriticalRegionHolder<'_>,
    ) -> Option<impl OutputHolder<V>>;
}
