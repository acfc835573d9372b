//! Process-wide diagnostic gauges.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., region bytes may briefly disagree with the sum of
//! used and free bytes). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions; every allocator keeps
//! its own exact accounting.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes currently handed out as regions by all providers
crate::sync::static_atomic! {
    pub static PROVIDER_MAPPED: Counter = Counter::new();
}
// Regions currently handed out by all providers
crate::sync::static_atomic! {
    pub static PROVIDER_REGIONS: Counter = Counter::new();
}

// Coarse allocator breakdown
crate::sync::static_atomic! {
    pub static COARSE_REGION_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static COARSE_USED_BYTES: Counter = Counter::new();
}

// Scalable pool breakdown
crate::sync::static_atomic! {
    pub static SLAB_BYTES: Counter = Counter::new();
}

/// Point-in-time view of the global gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub provider_mapped: usize,
    pub provider_regions: usize,
    pub coarse_region_bytes: usize,
    pub coarse_used_bytes: usize,
    pub slab_bytes: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        provider_mapped: PROVIDER_MAPPED.get(),
        provider_regions: PROVIDER_REGIONS.get(),
        coarse_region_bytes: COARSE_REGION_BYTES.get(),
        coarse_used_bytes: COARSE_USED_BYTES.get(),
        slab_bytes: SLAB_BYTES.get(),
    }
}
