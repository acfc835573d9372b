//! Scalable pool.
//!
//! Requests up to [`MAX_SMALL_SIZE`] are rounded to one of 44 size classes
//! and served from slabs: slab-aligned blocks of the coarse allocator, each
//! dedicated to one class. A slab tracks its free slots with a `u16` free
//! list threaded through the free slots plus a bump cursor over slots never
//! handed out. Larger requests go to the coarse allocator directly.
//!
//! Every thread keeps a cache of intrusive free lists per pool. Misses
//! refill a batch under the class lock; overflowing lists are flushed back.
//! A per-slab atomic bitmap records which slots are currently owned by the
//! caller, so double frees and stray pointers are caught without the class
//! lock.

use super::coarse::{CoarseAllocator, CoarseConfig};
use super::error::{MemError, Result};
use super::pool::{MIN_ALIGN, MemoryPool};
use super::provider::MemoryProvider;
use super::stats;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::owner::{Arc, Weak};
use crate::sync::{Mutex, RwLock, lock, read, write};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::ptr::NonNull;

/// Largest request served from a size class.
pub const MAX_SMALL_SIZE: usize = 65536;

pub const DEFAULT_SLAB_SIZE: usize = 256 * 1024;

/// Slot indices are `u16`: the smallest class must fit `u16::MAX - 1` times.
const MAX_SLAB_SIZE: usize = 512 * 1024;

const SLOT_SENTINEL: u16 = 0xFFFF;

/// Configuration for [`ScalablePool`]. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct ScalablePoolConfig {
    /// Max items in a thread cache list before it is flushed. Per class-size
    /// tier: `[<=1KB, <=8KB, <=32KB, >32KB]`. Default: `[64, 32, 8, 4]`.
    pub cache_count_limits: [u32; 4],

    /// Objects taken from the central bin per refill, per tier.
    /// Default: `[16, 8, 4, 2]`.
    pub alloc_extra: [u32; 4],

    /// Slab size and alignment. A power of two between 64 KiB and 512 KiB.
    /// Default: 256 KiB.
    pub slab_size: usize,

    /// Configuration of the underlying coarse allocator.
    pub coarse: CoarseConfig,
}

impl Default for ScalablePoolConfig {
    fn default() -> Self {
        Self {
            cache_count_limits: [64, 32, 8, 4],
            alloc_extra: [16, 8, 4, 2],
            slab_size: DEFAULT_SLAB_SIZE,
            coarse: CoarseConfig::default(),
        }
    }
}

impl ScalablePoolConfig {
    fn tier(class_size: usize) -> usize {
        if class_size <= 1024 {
            0
        } else if class_size <= 8192 {
            1
        } else if class_size <= 32768 {
            2
        } else {
            3
        }
    }

    /// Max thread cache items for the given class size.
    #[must_use]
    pub fn max_cache_for(&self, class_size: usize) -> u32 {
        self.cache_count_limits[Self::tier(class_size)]
    }

    /// Batch refill count for the given class size.
    #[must_use]
    pub fn batch_size_for(&self, class_size: usize) -> u32 {
        self.alloc_extra[Self::tier(class_size)].max(1)
    }

    fn validate(&self) -> Result<()> {
        if !self.slab_size.is_power_of_two()
            || !(MAX_SMALL_SIZE..=MAX_SLAB_SIZE).contains(&self.slab_size)
        {
            return Err(MemError::invalid(format!(
                "slab size {:#x} must be a power of two in {MAX_SMALL_SIZE:#x}..={MAX_SLAB_SIZE:#x}",
                self.slab_size
            )));
        }
        Ok(())
    }
}

// 44 size classes: 16B..128B (step 16), then four steps per doubling up to 64KB
pub(crate) const SIZE_CLASSES: [usize; 44] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024,
    1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288, 14336,
    16384, 20480, 24576, 28672, 32768, 40960, 49152, 57344, 65536,
];

/// Size-to-class lookup indexed by `ceil(size / 16)`.
static SIZE_CLASS_LUT: [u8; 4097] = build_size_class_lut();

#[allow(clippy::cast_possible_truncation)]
const fn build_size_class_lut() -> [u8; 4097] {
    let mut table = [0u8; 4097];
    let mut q: usize = 1;
    let mut class = 0;
    while class < SIZE_CLASSES.len() {
        let quanta = SIZE_CLASSES[class] / 16;
        while q <= quanta {
            table[q] = class as u8;
            q += 1;
        }
        class += 1;
    }
    table
}

/// Smallest class that holds `size` bytes and is a multiple of `align`.
/// Slabs are aligned to their size, so every slot of such a class is aligned.
pub(crate) fn size_class(size: usize, align: usize) -> Option<usize> {
    if size == 0 || size > MAX_SMALL_SIZE {
        return None;
    }
    let first = SIZE_CLASS_LUT[size.div_ceil(16)] as usize;
    (first..SIZE_CLASSES.len()).find(|&idx| SIZE_CLASSES[idx].is_multiple_of(align))
}

// ----------------------------------------------------------------------------
// Central bins
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct SlabMeta {
    free_head: u16,
    free_count: u16,
    bump: u16,
    capacity: u16,
}

impl SlabMeta {
    #[allow(clippy::cast_possible_truncation)]
    fn new(capacity: usize) -> Self {
        let capacity = capacity as u16;
        Self {
            free_head: SLOT_SENTINEL,
            free_count: capacity,
            bump: 0,
            capacity,
        }
    }

    fn is_empty(&self) -> bool {
        self.free_count == self.capacity
    }
}

#[derive(Debug, Default)]
struct SizeClassBin {
    slabs: HashMap<usize, SlabMeta>,
    /// Slabs with at least one free slot, by address.
    partial: BTreeSet<usize>,
}

impl SizeClassBin {
    fn insert(&mut self, base: usize, meta: SlabMeta) {
        self.slabs.insert(base, meta);
        self.partial.insert(base);
    }

    fn remove(&mut self, base: usize) {
        self.slabs.remove(&base);
        self.partial.remove(&base);
    }

    /// Take one slot from the lowest partial slab.
    fn take(&mut self, class_size: usize) -> Option<usize> {
        let &base = self.partial.first()?;
        let meta = self.slabs.get_mut(&base)?;
        let slot = if meta.free_head == SLOT_SENTINEL {
            let slot = meta.bump;
            meta.bump += 1;
            slot
        } else {
            let slot = meta.free_head;
            // Safety: a free slot stores the next free index in its first bytes.
            meta.free_head = unsafe { ((base + usize::from(slot) * class_size) as *const u16).read() };
            slot
        };
        meta.free_count -= 1;
        if meta.free_count == 0 {
            self.partial.remove(&base);
        }
        Some(base + usize::from(slot) * class_size)
    }

    /// Put a slot back. Returns true if its slab is now empty.
    #[allow(clippy::cast_possible_truncation)]
    fn give_back(&mut self, base: usize, addr: usize, class_size: usize) -> bool {
        let Some(meta) = self.slabs.get_mut(&base) else {
            debug_assert!(false, "slot {addr:#x} returned to a slab this bin does not own");
            return false;
        };
        let slot = ((addr - base) / class_size) as u16;
        // Safety: the slot is free and at least 16 bytes long.
        unsafe { (addr as *mut u16).write(meta.free_head) };
        meta.free_head = slot;
        meta.free_count += 1;
        if meta.free_count == 1 {
            self.partial.insert(base);
        }
        meta.is_empty()
    }
}

/// Per-slab ownership bitmap; bit set while the slot is held by the caller.
struct SlabInfo {
    class: usize,
    capacity: usize,
    live: Box<[AtomicU64]>,
}

impl SlabInfo {
    fn slot(&self, base: usize, addr: usize) -> Option<usize> {
        let offset = addr - base;
        let class_size = SIZE_CLASSES[self.class];
        let slot = offset / class_size;
        (offset.is_multiple_of(class_size) && slot < self.capacity).then_some(slot)
    }

    fn bit(slot: usize) -> (usize, u64) {
        (slot / 64, 1u64 << (slot % 64))
    }

    fn is_live(&self, slot: usize) -> bool {
        let (word, bit) = Self::bit(slot);
        self.live[word].load(Ordering::Acquire) & bit != 0
    }
}

// ----------------------------------------------------------------------------
// Thread Cache
// ----------------------------------------------------------------------------

pub(crate) struct LocalFreeList {
    head: Option<NonNull<u8>>,
    count: u32,
}

impl LocalFreeList {
    const fn new() -> Self {
        Self { head: None, count: 0 }
    }

    fn push(&mut self, ptr: NonNull<u8>) {
        // Safety: cached slots are free, aligned to 16 and at least 16 bytes.
        unsafe {
            *ptr.cast::<usize>().as_ptr() = self.head.map_or(0, |p| p.as_ptr() as usize);
        }
        self.head = Some(ptr);
        self.count += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let ptr = self.head?;
        // Safety: see push.
        let next = unsafe { *ptr.cast::<usize>().as_ptr() };
        self.head = NonNull::new(next as *mut u8);
        self.count -= 1;
        Some(ptr)
    }

    /// Forget the list without touching the slots.
    fn discard(&mut self) {
        self.head = None;
        self.count = 0;
    }
}

/// One thread's cache for one pool.
struct PoolCache {
    pool_id: u64,
    owner: Weak<Shared>,
    epoch: u64,
    bins: Vec<LocalFreeList>,
}

impl PoolCache {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            pool_id: shared.id,
            owner: Arc::downgrade(shared),
            epoch: shared.trim_epoch.load(Ordering::Acquire),
            bins: (0..SIZE_CLASSES.len()).map(|_| LocalFreeList::new()).collect(),
        }
    }

    fn flush(&mut self, shared: &Shared) {
        for (class, list) in self.bins.iter_mut().enumerate() {
            shared.flush_list(class, list);
        }
    }

    fn discard(&mut self) {
        self.bins.iter_mut().for_each(LocalFreeList::discard);
    }
}

/// Every pool cache of one thread.
struct ThreadCaches {
    entries: RefCell<Vec<PoolCache>>,
}

impl Drop for ThreadCaches {
    fn drop(&mut self) {
        // Flush caches of pools that are still alive. A dropped pool's memory
        // is gone, so its lists are forgotten without being walked.
        for mut cache in self.entries.get_mut().drain(..) {
            match cache.owner.upgrade() {
                Some(shared) => cache.flush(&shared),
                None => cache.discard(),
            }
        }
    }
}

thread_local! {
    static THREAD_CACHES: ThreadCaches = const {
        ThreadCaches {
            entries: RefCell::new(Vec::new()),
        }
    };
}

crate::sync::static_atomic! {
    static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
}

// ----------------------------------------------------------------------------
// Pool
// ----------------------------------------------------------------------------

struct Shared {
    id: u64,
    coarse: CoarseAllocator,
    config: ScalablePoolConfig,
    bins: Vec<Mutex<SizeClassBin>>,
    slabs: RwLock<HashMap<usize, SlabInfo>>,
    trim_epoch: AtomicU64,
}

impl Shared {
    fn slab_base(&self, addr: usize) -> usize {
        addr & !(self.config.slab_size - 1)
    }

    /// Run `f` on this thread's cache for the pool. `None` when the thread
    /// cache is unavailable (thread teardown or re-entrancy).
    fn with_cache<R>(self: &Arc<Self>, f: impl FnOnce(&mut PoolCache) -> R) -> Option<R> {
        THREAD_CACHES
            .try_with(|tc| {
                let mut entries = tc.entries.try_borrow_mut().ok()?;
                let idx = match entries.iter().position(|c| c.pool_id == self.id) {
                    Some(idx) => idx,
                    None => {
                        // Entries of dropped pools go without being walked.
                        entries.retain(|c| c.owner.strong_count() > 0);
                        entries.push(PoolCache::new(self));
                        entries.len() - 1
                    }
                };
                let cache = &mut entries[idx];
                let epoch = self.trim_epoch.load(Ordering::Acquire);
                if cache.epoch != epoch {
                    cache.epoch = epoch;
                    cache.flush(self);
                }
                Some(f(cache))
            })
            .ok()
            .flatten()
    }

    fn new_slab(&self, class: usize) -> Result<()> {
        let slab_size = self.config.slab_size;
        let ptr = self.coarse.allocate(slab_size, slab_size)?;
        let base = ptr.as_ptr() as usize;
        let capacity = slab_size / SIZE_CLASSES[class];
        let live = (0..capacity.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();

        write(&self.slabs).insert(base, SlabInfo { class, capacity, live });
        lock(&self.bins[class]).insert(base, SlabMeta::new(capacity));
        stats::SLAB_BYTES.add(slab_size);
        log::debug!(
            "scalable: new slab {base:#x} for class {} ({capacity} slots)",
            SIZE_CLASSES[class]
        );
        Ok(())
    }

    fn release_slab(&self, base: usize) {
        write(&self.slabs).remove(&base);
        stats::SLAB_BYTES.sub(self.config.slab_size);
        // Safety: base is the non-null start of a coarse block.
        let ptr = unsafe { NonNull::new_unchecked(base as *mut u8) };
        match self.coarse.deallocate(ptr) {
            Ok(()) => log::debug!("scalable: released slab {base:#x}"),
            Err(e) => log::warn!("scalable: failed to release slab {base:#x}: {e}"),
        }
    }

    /// Take up to `count` slots of `class`. The first is returned, the rest
    /// are passed to `spill`. Grows a new slab when the bin is exhausted.
    fn take_batch(&self, class: usize, count: u32, mut spill: impl FnMut(NonNull<u8>)) -> Result<NonNull<u8>> {
        let class_size = SIZE_CLASSES[class];
        loop {
            {
                let mut bin = lock(&self.bins[class]);
                if let Some(first) = bin.take(class_size) {
                    for _ in 1..count {
                        let Some(addr) = bin.take(class_size) else { break };
                        // Safety: slot addresses are non-null.
                        spill(unsafe { NonNull::new_unchecked(addr as *mut u8) });
                    }
                    // Safety: as above.
                    return Ok(unsafe { NonNull::new_unchecked(first as *mut u8) });
                }
            }
            // Coarse growth runs without the class lock.
            self.new_slab(class)?;
        }
    }

    fn alloc_cached(&self, cache: &mut PoolCache, class: usize) -> Result<NonNull<u8>> {
        let list = &mut cache.bins[class];
        if let Some(ptr) = list.pop() {
            return Ok(ptr);
        }
        let batch = self.config.batch_size_for(SIZE_CLASSES[class]);
        self.take_batch(class, batch, |ptr| list.push(ptr))
    }

    /// Return every slot of `list` to the central bin, releasing slabs that
    /// become empty unless they are the last slab of the class.
    fn flush_list(&self, class: usize, list: &mut LocalFreeList) {
        if list.count == 0 {
            return;
        }
        log::trace!("scalable: flushing {} slots of class {}", list.count, SIZE_CLASSES[class]);
        let class_size = SIZE_CLASSES[class];
        let mut empty = Vec::new();
        {
            let mut bin = lock(&self.bins[class]);
            while let Some(ptr) = list.pop() {
                let addr = ptr.as_ptr() as usize;
                let base = self.slab_base(addr);
                if bin.give_back(base, addr, class_size) && bin.slabs.len() > 1 {
                    bin.remove(base);
                    empty.push(base);
                }
            }
        }
        for base in empty {
            self.release_slab(base);
        }
    }

    fn free_central(&self, class: usize, ptr: NonNull<u8>) {
        let mut list = LocalFreeList::new();
        list.push(ptr);
        self.flush_list(class, &mut list);
    }

    /// Record that the slot at `ptr` now belongs to the caller.
    fn mark_live(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let base = self.slab_base(addr);
        let slabs = read(&self.slabs);
        if let Some(info) = slabs.get(&base)
            && let Some(slot) = info.slot(base, addr)
        {
            let (word, bit) = SlabInfo::bit(slot);
            let prev = info.live[word].fetch_or(bit, Ordering::AcqRel);
            debug_assert_eq!(prev & bit, 0, "slot {addr:#x} handed out twice");
        }
    }

    /// Class of the slab holding `ptr`, or `None` if `ptr` is not inside a
    /// slab.
    fn slab_class(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        read(&self.slabs).get(&self.slab_base(addr)).map(|info| info.class)
    }

    /// Take the slot at `ptr` back from the caller. `Ok(None)` if `ptr` is
    /// not inside a slab.
    fn release_live(&self, ptr: NonNull<u8>) -> Result<Option<usize>> {
        let addr = ptr.as_ptr() as usize;
        let base = self.slab_base(addr);
        let slabs = read(&self.slabs);
        let Some(info) = slabs.get(&base) else {
            return Ok(None);
        };
        let slot = info.slot(base, addr).ok_or(MemError::InvalidPointer(addr))?;
        let (word, bit) = SlabInfo::bit(slot);
        if info.live[word].fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            return Err(MemError::InvalidPointer(addr));
        }
        Ok(Some(info.class))
    }

    /// Usable size of a live slot, `Ok(None)` outside slabs.
    fn slot_size(&self, ptr: NonNull<u8>) -> Result<Option<usize>> {
        let addr = ptr.as_ptr() as usize;
        let base = self.slab_base(addr);
        let slabs = read(&self.slabs);
        let Some(info) = slabs.get(&base) else {
            return Ok(None);
        };
        match info.slot(base, addr) {
            Some(slot) if info.is_live(slot) => Ok(Some(SIZE_CLASSES[info.class])),
            _ => Err(MemError::InvalidPointer(addr)),
        }
    }

    /// Release every empty slab, including the last one of each class.
    fn release_empty_slabs(&self) {
        for bin in &self.bins {
            let empty: Vec<usize> = {
                let mut bin = lock(bin);
                let empty: Vec<usize> = bin
                    .slabs
                    .iter()
                    .filter(|(_, meta)| meta.is_empty())
                    .map(|(&base, _)| base)
                    .collect();
                for &base in &empty {
                    bin.remove(base);
                }
                empty
            };
            for base in empty {
                self.release_slab(base);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slabs: Vec<(usize, SlabInfo)> = write(&self.slabs).drain().collect();
        let leaked: u32 = slabs
            .iter()
            .flat_map(|(_, info)| info.live.iter())
            .map(|word| word.load(Ordering::Relaxed).count_ones())
            .sum();
        if leaked > 0 {
            log::warn!("scalable: pool dropped with {leaked} live small objects");
        }
        for (base, _) in slabs {
            stats::SLAB_BYTES.sub(self.config.slab_size);
            // Safety: base is the non-null start of a coarse block.
            let ptr = unsafe { NonNull::new_unchecked(base as *mut u8) };
            if let Err(e) = self.coarse.deallocate(ptr) {
                log::warn!("scalable: failed to release slab {base:#x} at teardown: {e}");
            }
        }
    }
}

/// Size-class pool with per-thread caches.
pub struct ScalablePool {
    shared: Arc<Shared>,
}

impl ScalablePool {
    /// # Errors
    ///
    /// Infallible with the default configuration.
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Result<Self> {
        Self::with_config(provider, ScalablePoolConfig::default())
    }

    /// # Errors
    ///
    /// `InvalidArgument` if the slab size is out of range.
    pub fn with_config(provider: Arc<dyn MemoryProvider>, config: ScalablePoolConfig) -> Result<Self> {
        config.validate()?;
        let coarse = CoarseAllocator::with_config(provider, config.coarse.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                coarse,
                bins: (0..SIZE_CLASSES.len()).map(|_| Mutex::new(SizeClassBin::default())).collect(),
                slabs: RwLock::new(HashMap::new()),
                trim_epoch: AtomicU64::new(0),
                config,
            }),
        })
    }

    #[must_use]
    pub fn coarse(&self) -> &CoarseAllocator {
        &self.shared.coarse
    }

    /// Slabs currently carved from the coarse allocator.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        read(&self.shared.slabs).len()
    }
}

impl Drop for ScalablePool {
    fn drop(&mut self) {
        let id = self.shared.id;
        // This thread's cache goes with the pool; other threads discard
        // theirs lazily once the pool is gone.
        let _ = THREAD_CACHES.try_with(|tc| {
            if let Ok(mut entries) = tc.entries.try_borrow_mut() {
                entries.retain(|c| c.pool_id != id);
            }
        });
    }
}

impl MemoryPool for ScalablePool {
    fn name(&self) -> &'static str {
        "scalable"
    }

    fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.aligned_malloc(size, MIN_ALIGN)
    }

    fn aligned_malloc(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(MemError::invalid("allocation size must be positive"));
        }
        if !align.is_power_of_two() {
            return Err(MemError::invalid(format!(
                "alignment {align:#x} is not a power of two"
            )));
        }
        let Some(class) = size_class(size, align) else {
            return self.shared.coarse.allocate(size, align.max(MIN_ALIGN));
        };

        let shared = &self.shared;
        let ptr = match shared.with_cache(|cache| shared.alloc_cached(cache, class)) {
            Some(result) => result?,
            None => shared.take_batch(class, 1, |_| {})?,
        };
        shared.mark_live(ptr);
        Ok(ptr)
    }

    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.malloc(size).map(Some);
        };
        if size == 0 {
            // Safety: forwarded precondition.
            unsafe { self.free(ptr)? };
            return Ok(None);
        }

        let old = self.malloc_usable_size(ptr)?;
        if self.shared.slab_class(ptr).is_some() {
            if size <= old {
                return Ok(Some(ptr));
            }
        } else if size <= old {
            self.shared.coarse.shrink_in_place(ptr, size)?;
            return Ok(Some(ptr));
        } else if self.shared.coarse.try_grow_in_place(ptr, size)? {
            return Ok(Some(ptr));
        }

        let new = self.malloc(size)?;
        // Safety: both allocations are live, distinct and at least
        // `min(old, size)` long.
        unsafe { new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old.min(size)) };
        // Safety: forwarded precondition.
        unsafe { self.free(ptr)? };
        Ok(Some(new))
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let shared = &self.shared;
        let Some(class) = shared.release_live(ptr)? else {
            return shared.coarse.deallocate(ptr);
        };

        let cached = shared.with_cache(|cache| {
            let list = &mut cache.bins[class];
            list.push(ptr);
            if list.count > shared.config.max_cache_for(SIZE_CLASSES[class]) {
                shared.flush_list(class, list);
            }
        });
        if cached.is_none() {
            shared.free_central(class, ptr);
        }
        Ok(())
    }

    fn malloc_usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        match self.shared.slot_size(ptr)? {
            Some(size) => Ok(size),
            None => self.shared.coarse.usable_size(ptr),
        }
    }

    /// Flush this thread's cache now and every other thread's cache on its
    /// next pool operation, then release empty slabs.
    fn trim(&self) {
        self.shared.trim_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.with_cache(|_| ());
        self.shared.release_empty_slabs();
    }

    fn provider(&self) -> &Arc<dyn MemoryProvider> {
        self.shared.coarse.provider()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::error::Status;
    use crate::memory::fixed_provider::FixedMemoryProvider;
    use crate::memory::os_provider::OsMemoryProvider;
    use crate::memory::params::{FixedMemoryParams, OsMemoryParams};

    fn pool() -> ScalablePool {
        let provider = FixedMemoryProvider::new(&FixedMemoryParams::new(16 << 20).unwrap()).unwrap();
        ScalablePool::new(Arc::new(provider)).unwrap()
    }

    #[test]
    fn test_size_class_lookup() {
        assert_eq!(size_class(1, 1), Some(0));
        assert_eq!(size_class(16, 16), Some(0));
        assert_eq!(size_class(17, 16), Some(1));
        assert_eq!(SIZE_CLASSES[size_class(129, 16).unwrap()], 160);
        assert_eq!(SIZE_CLASSES[size_class(65536, 16).unwrap()], 65536);
        // 48 is not a multiple of 32; the next class is.
        assert_eq!(SIZE_CLASSES[size_class(40, 32).unwrap()], 64);
        assert_eq!(SIZE_CLASSES[size_class(100, 4096).unwrap()], 4096);
        assert_eq!(size_class(65537, 16), None);
        assert_eq!(size_class(0, 16), None);
    }

    #[test]
    fn test_size_class_lut_is_monotonic() {
        for size in 1..=MAX_SMALL_SIZE {
            let class = size_class(size, 1).unwrap();
            assert!(SIZE_CLASSES[class] >= size);
            if class > 0 {
                assert!(SIZE_CLASSES[class - 1] < size, "size {size} skipped a class");
            }
        }
    }

    #[test]
    fn test_config_tiers() {
        let config = ScalablePoolConfig::default();
        assert_eq!(config.max_cache_for(16), 64);
        assert_eq!(config.max_cache_for(4096), 32);
        assert_eq!(config.max_cache_for(32768), 8);
        assert_eq!(config.max_cache_for(65536), 4);
        assert_eq!(config.batch_size_for(1024), 16);
        assert_eq!(config.batch_size_for(40960), 2);
    }

    #[test]
    fn test_rejects_bad_slab_size() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let provider: Arc<dyn MemoryProvider> = Arc::new(OsMemoryProvider::new(&OsMemoryParams::new()).unwrap());
        for slab_size in [0, 3 << 16, 1 << 15, 1 << 20] {
            let config = ScalablePoolConfig {
                slab_size,
                ..ScalablePoolConfig::default()
            };
            let err = ScalablePool::with_config(provider.clone(), config).err().unwrap();
            assert_eq!(err.status(), Status::InvalidArgument);
        }
    }

    #[test]
    fn test_small_objects_are_distinct_and_aligned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let mut ptrs = Vec::new();
        for i in 0..2000usize {
            let size = 1 + (i * 37) % 3000;
            let p = pool.malloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
            assert!(pool.malloc_usable_size(p).unwrap() >= size);
            // Safety: Test code.
            unsafe { p.as_ptr().write_bytes((i % 251) as u8, size) };
            ptrs.push((p, size, (i % 251) as u8));
        }
        for &(p, size, byte) in &ptrs {
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == byte));
        }
        for (p, _, _) in ptrs {
            // Safety: Test code.
            unsafe { pool.free(p).unwrap() };
        }
    }

    #[test]
    fn test_aligned_small_and_large() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        for shift in 4..=17 {
            let align = 1usize << shift;
            let p = pool.aligned_malloc(24, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "align {align:#x}");
            // Safety: Test code.
            unsafe { pool.free(p).unwrap() };
        }
        assert_eq!(
            pool.aligned_malloc(24, 24).unwrap_err().status(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_large_objects_bypass_slabs() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let p = pool.malloc(MAX_SMALL_SIZE + 1).unwrap();
        assert_eq!(pool.slab_count(), 0);
        assert!(pool.malloc_usable_size(p).unwrap() > MAX_SMALL_SIZE);
        // Safety: Test code.
        unsafe {
            pool.free(p).unwrap();
            assert_eq!(pool.free(p).unwrap_err().status(), Status::InvalidPointer);
        }
    }

    #[test]
    fn test_double_free_and_stray_pointers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let keep = pool.malloc(64).unwrap();
        let p = pool.malloc(64).unwrap();
        // Safety: Test code; the invalid pointers are never dereferenced.
        unsafe {
            pool.free(p).unwrap();
            assert_eq!(pool.free(p).unwrap_err().status(), Status::InvalidPointer);
            assert_eq!(pool.malloc_usable_size(p).unwrap_err().status(), Status::InvalidPointer);

            let interior = NonNull::new_unchecked(keep.as_ptr().add(8));
            assert_eq!(pool.free(interior).unwrap_err().status(), Status::InvalidPointer);

            let mut local = 0u64;
            let stray = NonNull::from(&mut local).cast::<u8>();
            assert_eq!(pool.free(stray).unwrap_err().status(), Status::InvalidPointer);

            pool.free(keep).unwrap();
        }
    }

    #[test]
    fn test_realloc_moves_between_classes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        // Safety: Test code.
        unsafe {
            let p = pool.malloc(40).unwrap();
            p.as_ptr().copy_from_nonoverlapping(b"scalable pool payload".as_ptr(), 21);
            let same = pool.realloc(Some(p), 48).unwrap().unwrap();
            assert_eq!(same, p);

            let q = pool.realloc(Some(p), 200_000).unwrap().unwrap();
            assert_ne!(q, p);
            assert_eq!(std::slice::from_raw_parts(q.as_ptr(), 21), b"scalable pool payload");

            let r = pool.realloc(Some(q), 100).unwrap().unwrap();
            assert_eq!(r, q, "large blocks shrink in place");
            assert_eq!(pool.realloc(Some(r), 0).unwrap(), None);
        }
    }

    #[test]
    fn test_trim_returns_empty_slabs() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let ptrs: Vec<_> = (0..500).map(|_| pool.malloc(512).unwrap()).collect();
        assert!(pool.slab_count() >= 1);
        for p in ptrs {
            // Safety: Test code.
            unsafe { pool.free(p).unwrap() };
        }
        pool.trim();
        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.coarse().stats().used_bytes, 0);
    }

    #[test]
    fn test_thread_exit_flushes_cache() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(pool());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                crate::sync::thread::spawn(move || {
                    for round in 0..200usize {
                        let size = 16 + (round * 13 + t * 7) % 1000;
                        let p = pool.malloc(size).unwrap();
                        // Safety: Test code.
                        unsafe {
                            p.as_ptr().write_bytes(t as u8, size);
                            pool.free(p).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Nothing is left in the exited threads' caches.
        pool.trim();
        assert_eq!(pool.slab_count(), 0);
    }

    #[test]
    fn test_cross_thread_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(pool());
        let addrs: Vec<usize> = (0..300).map(|i| pool.malloc(16 + i % 200).unwrap().as_ptr() as usize).collect();
        let remote = pool.clone();
        crate::sync::thread::spawn(move || {
            for addr in addrs {
                let p = NonNull::new(addr as *mut u8).unwrap();
                // Safety: Test code; each pointer is freed exactly once.
                unsafe { remote.free(p).unwrap() };
            }
        })
        .join()
        .unwrap();
        pool.trim();
        assert_eq!(pool.slab_count(), 0);
    }

    #[test]
    fn test_dropped_pool_cache_is_discarded() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let provider: Arc<dyn MemoryProvider> =
            Arc::new(FixedMemoryProvider::new(&FixedMemoryParams::new(8 << 20).unwrap()).unwrap());
        let first = Arc::new(ScalablePool::new(provider.clone()).unwrap());
        let worker = first.clone();
        let (to_worker, from_main) = std::sync::mpsc::channel::<()>();
        let handle = crate::sync::thread::spawn(move || {
            // Leave objects in this thread's cache, then outlive the pool.
            for _ in 0..10 {
                let p = worker.malloc(64).unwrap();
                // Safety: Test code.
                unsafe { worker.free(p).unwrap() };
            }
            drop(worker);
            from_main.recv().unwrap();
            let second = ScalablePool::new(provider).unwrap();
            let p = second.malloc(64).unwrap();
            // Safety: Test code.
            unsafe { second.free(p).unwrap() };
        });
        drop(first);
        to_worker.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_concurrent_mixed_sizes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let provider: Arc<dyn MemoryProvider> = Arc::new(OsMemoryProvider::new(&OsMemoryParams::new()).unwrap());
        let pool = Arc::new(ScalablePool::new(provider.clone()).unwrap());
        let handles: Vec<_> = (0..8usize)
            .map(|t| {
                let pool = pool.clone();
                crate::sync::thread::spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..1000usize {
                        let size = match i % 10 {
                            9 => 70_000 + i,
                            _ => 1 + (i * 131 + t) % 8000,
                        };
                        let p = pool.malloc(size).unwrap();
                        // Safety: Test code.
                        unsafe { p.as_ptr().write_bytes(t as u8, size) };
                        live.push((p, size));
                        if i % 2 == 1 {
                            let (p, size) = live.swap_remove(live.len() / 2);
                            // Safety: Test code.
                            unsafe {
                                let bytes = std::slice::from_raw_parts(p.as_ptr(), size);
                                assert!(bytes.iter().all(|&b| b == t as u8));
                                pool.free(p).unwrap();
                            }
                        }
                    }
                    for (p, _) in live {
                        // Safety: Test code.
                        unsafe { pool.free(p).unwrap() };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        drop(pool);
        assert_eq!(provider.outstanding_regions(), 0);
    }
}
