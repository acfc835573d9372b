//! Coarse allocator.
//!
//! Carves arbitrarily sized, aligned blocks out of provider regions. Every
//! byte of every region belongs to exactly one block, used or free. Free
//! neighbours inside a region are always merged, and a region whose single
//! block is free can go back to the provider, subject to its release order.
//!
//! Bookkeeping lives entirely outside the managed memory: the provider's
//! memory may be device or file backed and is never written by the allocator.

use super::error::{MemError, Result};
use super::provider::{MemoryProvider, ProviderCaps, Region, ReleaseOrder};
use super::stats;
use crate::sync::owner::Arc;
use crate::sync::{Mutex, lock};
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

/// Granularity of block lengths and minimum block alignment.
pub const BLOCK_QUANTUM: usize = 16;

pub const DEFAULT_MIN_REGION_SIZE: usize = 1024 * 1024;

/// Configuration for [`CoarseAllocator`].
#[derive(Clone, Debug)]
pub struct CoarseConfig {
    /// Smallest region requested from the provider. Larger regions mean fewer
    /// provider calls; a provider that cannot supply this much is retried
    /// with the bare request size.
    pub min_region_size: usize,
    /// Return regions to the provider as soon as they are entirely free.
    /// When false, regions are kept until the allocator is dropped.
    pub release_empty_regions: bool,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            min_region_size: DEFAULT_MIN_REGION_SIZE,
            release_empty_regions: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct RegionEntry {
    region: Region,
    /// Acquisition order; the newest region has the highest value.
    seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    len: usize,
    /// Base of the owning region.
    region: usize,
    used: bool,
}

#[derive(Debug, Default)]
struct CoarseState {
    regions: BTreeMap<usize, RegionEntry>,
    /// Region bases by acquisition order.
    by_seq: BTreeMap<u64, usize>,
    /// Every block of every region, by address.
    blocks: BTreeMap<usize, Block>,
    /// Free blocks as `(len, addr)`.
    free_by_size: BTreeSet<(usize, usize)>,
    next_seq: u64,
    region_bytes: usize,
    used_bytes: usize,
}

impl CoarseState {
    fn insert_free(&mut self, addr: usize, len: usize, region: usize) {
        self.blocks.insert(
            addr,
            Block {
                len,
                region,
                used: false,
            },
        );
        self.free_by_size.insert((len, addr));
    }

    fn remove_free(&mut self, addr: usize) -> Option<Block> {
        let block = *self.blocks.get(&addr)?;
        if block.used {
            return None;
        }
        self.blocks.remove(&addr);
        self.free_by_size.remove(&(block.len, addr));
        Some(block)
    }

    fn attach(&mut self, region: Region) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert_region(RegionEntry { region, seq });
    }

    fn insert_region(&mut self, entry: RegionEntry) {
        let region = entry.region;
        self.regions.insert(region.addr(), entry);
        self.by_seq.insert(entry.seq, region.addr());
        self.insert_free(region.addr(), region.len(), region.addr());
        self.region_bytes += region.len();
        stats::COARSE_REGION_BYTES.add(region.len());
    }

    /// Best fit: smallest free block that holds `size` bytes at an `align`
    /// boundary, lowest address among equal sizes.
    fn find_fit(&self, size: usize, align: usize) -> Option<usize> {
        self.free_by_size
            .range((size, 0)..)
            .find(|&&(len, addr)| {
                addr.checked_next_multiple_of(align)
                    .and_then(|aligned| (aligned - addr).checked_add(size))
                    .is_some_and(|need| need <= len)
            })
            .map(|&(_, addr)| addr)
    }

    /// Split the free block at `addr` into leading padding, the used block and
    /// a trailing remainder. Returns a pointer to the used block.
    fn carve(&mut self, addr: usize, size: usize, align: usize) -> Option<NonNull<u8>> {
        let region = self.blocks.get(&addr)?.region;
        let base = self.regions.get(&region)?.region.base();
        let block = self.remove_free(addr)?;
        let start = addr.next_multiple_of(align);
        let pad = start - addr;
        if pad > 0 {
            self.insert_free(addr, pad, region);
        }
        self.blocks.insert(
            start,
            Block {
                len: size,
                region,
                used: true,
            },
        );
        let rest = block.len - pad - size;
        if rest > 0 {
            self.insert_free(start + size, rest, region);
        }
        self.used_bytes += size;
        stats::COARSE_USED_BYTES.add(size);
        // Safety: start lies inside the region, so it is non-null.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().with_addr(start)) })
    }

    fn take_fit(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let addr = self.find_fit(size, align)?;
        self.carve(addr, size, align)
    }

    /// Mark the used block at `addr` free and merge it with free neighbours
    /// of the same region. Returns the merged block's address.
    fn free_block(&mut self, addr: usize) -> Result<usize> {
        let block = match self.blocks.get(&addr) {
            Some(b) if b.used => *b,
            _ => return Err(MemError::InvalidPointer(addr)),
        };
        self.blocks.remove(&addr);
        self.used_bytes -= block.len;
        stats::COARSE_USED_BYTES.sub(block.len);

        Ok(self.insert_coalesced(addr, block.len, block.region))
    }

    /// Insert a free range, merging it with adjacent free blocks of `region`.
    fn insert_coalesced(&mut self, mut addr: usize, mut len: usize, region: usize) -> usize {
        if let Some((&prev, &b)) = self.blocks.range(..addr).next_back()
            && !b.used
            && b.region == region
            && prev + b.len == addr
        {
            self.remove_free(prev);
            addr = prev;
            len += b.len;
        }
        if let Some(&b) = self.blocks.get(&(addr + len))
            && !b.used
            && b.region == region
        {
            self.remove_free(addr + len);
            len += b.len;
        }
        self.insert_free(addr, len, region);
        addr
    }

    fn is_region_free(&self, entry: &RegionEntry) -> bool {
        self.blocks
            .get(&entry.region.addr())
            .is_some_and(|b| !b.used && b.len == entry.region.len())
    }

    fn detach(&mut self, base: usize) -> Option<RegionEntry> {
        let entry = self.regions.remove(&base)?;
        self.by_seq.remove(&entry.seq);
        self.remove_free(base);
        self.region_bytes -= entry.region.len();
        stats::COARSE_REGION_BYTES.sub(entry.region.len());
        Some(entry)
    }

    /// Detach the region owning the free block at `addr` if it is entirely
    /// free.
    fn detach_if_empty(&mut self, addr: usize) -> Option<RegionEntry> {
        let region = self.blocks.get(&addr)?.region;
        let entry = *self.regions.get(&region)?;
        if self.is_region_free(&entry) {
            self.detach(region)
        } else {
            None
        }
    }

    /// Detach the newest region while it is entirely free, newest first.
    fn detach_free_tail(&mut self) -> Vec<RegionEntry> {
        let mut detached = Vec::new();
        while let Some(newest) = self.newest()
            && self.is_region_free(&newest)
        {
            detached.extend(self.detach(newest.region.addr()));
        }
        detached
    }

    fn newest_is_free(&self) -> bool {
        self.newest().is_some_and(|e| self.is_region_free(&e))
    }

    fn newest(&self) -> Option<RegionEntry> {
        let (_, base) = self.by_seq.last_key_value()?;
        self.regions.get(base).copied()
    }

    fn used_block(&self, addr: usize) -> Result<Block> {
        match self.blocks.get(&addr) {
            Some(b) if b.used => Ok(*b),
            _ => Err(MemError::InvalidPointer(addr)),
        }
    }
}

/// Usage summary of one coarse allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoarseStats {
    pub regions: usize,
    pub region_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
}

/// One block as reported by [`CoarseAllocator::snapshot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub len: usize,
    pub region: usize,
    pub used: bool,
}

/// Regions (`(base, len)`) and blocks, both in address order.
#[derive(Clone, Debug, Default)]
pub struct CoarseSnapshot {
    pub regions: Vec<(usize, usize)>,
    pub blocks: Vec<BlockInfo>,
}

/// Sub-allocator over the regions of one provider.
///
/// One allocator-wide lock guards the bookkeeping. Provider calls never run
/// under it: growth acquires the region first and then inserts it, and
/// release detaches regions under the lock and hands them back afterwards.
///
/// For LIFO providers a second lock serializes every provider call with the
/// bookkeeping that records it, so acquisition order in the allocator always
/// matches the provider's stack.
pub struct CoarseAllocator {
    provider: Arc<dyn MemoryProvider>,
    caps: ProviderCaps,
    config: CoarseConfig,
    state: Mutex<CoarseState>,
    /// Held across provider calls for LIFO providers. Taken before `state`.
    provider_order: Mutex<()>,
}

impl CoarseAllocator {
    #[must_use]
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Self {
        Self::with_config(provider, CoarseConfig::default())
    }

    #[must_use]
    pub fn with_config(provider: Arc<dyn MemoryProvider>, config: CoarseConfig) -> Self {
        Self {
            caps: provider.caps(),
            provider,
            config,
            state: Mutex::new(CoarseState::default()),
            provider_order: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    #[must_use]
    pub fn config(&self) -> &CoarseConfig {
        &self.config
    }

    fn normalize(size: usize, align: usize) -> Result<(usize, usize)> {
        if size == 0 {
            return Err(MemError::invalid("allocation size must be positive"));
        }
        if !align.is_power_of_two() {
            return Err(MemError::invalid(format!(
                "alignment {align:#x} is not a power of two"
            )));
        }
        let align = align.max(BLOCK_QUANTUM);
        // Room for the block plus worst-case padding must stay addressable.
        let size = size
            .checked_next_multiple_of(BLOCK_QUANTUM)
            .filter(|&s| s.checked_add(align - 1).is_some_and(|n| n <= isize::MAX as usize))
            .ok_or_else(|| {
                MemError::invalid(format!("allocation size {size:#x}@{align:#x} overflows"))
            })?;
        Ok((size, align))
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero size, a non power-of-two alignment or a
    ///   size that overflows once rounded and padded to `align`. The provider
    ///   is not consulted.
    /// - Any provider error when the request cannot be served from existing
    ///   regions and growth fails.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let (size, align) = Self::normalize(size, align)?;

        {
            let mut state = lock(&self.state);
            if let Some(ptr) = state.take_fit(size, align) {
                return Ok(ptr);
            }
        }

        let order = (self.caps.release_order == ReleaseOrder::Lifo)
            .then(|| lock(&self.provider_order));
        if order.is_some()
            && let Some(ptr) = lock(&self.state).take_fit(size, align)
        {
            return Ok(ptr);
        }
        let region = self.grow(size, align)?;
        let mut state = lock(&self.state);
        state.attach(region);
        // The new region is aligned to `align` and at least `size` long, so
        // the request always comes from it.
        state
            .carve(region.addr(), size, align)
            .ok_or(MemError::OutOfMemory)
    }

    fn grow(&self, size: usize, align: usize) -> Result<Region> {
        let preferred = size
            .max(self.provider.recommended_page_size(size))
            .max(self.config.min_region_size);
        let region = match self.provider.alloc(preferred, align) {
            Err(MemError::OutOfMemory) if preferred > size => self.provider.alloc(size, align)?,
            other => other?,
        };
        log::debug!(
            "coarse: acquired {} region {:#x}+{:#x} for {size:#x}@{align:#x}",
            region.provider(),
            region.addr(),
            region.len()
        );
        Ok(region)
    }

    /// Free the block starting at `ptr`.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` if `ptr` is not the start of a live block.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        {
            let mut state = lock(&self.state);
            let merged = state.free_block(addr)?;
            if !self.config.release_empty_regions {
                return Ok(());
            }
            match self.caps.release_order {
                ReleaseOrder::Any => {
                    let detached = state.detach_if_empty(merged);
                    drop(state);
                    self.release(detached.into_iter().collect());
                    return Ok(());
                }
                ReleaseOrder::Lifo if !state.newest_is_free() => return Ok(()),
                ReleaseOrder::Lifo => {}
            }
        }

        // LIFO: no region may be acquired between detaching the free tail
        // and handing it back. Re-check under both locks.
        let _order = lock(&self.provider_order);
        let detached = lock(&self.state).detach_free_tail();
        self.release(detached);
        Ok(())
    }

    /// Hand detached regions back, newest first. A refused region and every
    /// region after it are attached again.
    fn release(&self, detached: Vec<RegionEntry>) {
        for (i, entry) in detached.iter().enumerate() {
            let region = entry.region;
            match self.provider.free(region) {
                Ok(()) => log::debug!(
                    "coarse: released {} region {:#x}+{:#x}",
                    region.provider(),
                    region.addr(),
                    region.len()
                ),
                Err(e) => {
                    log::warn!(
                        "coarse: {} refused region {:#x}+{:#x}: {e}",
                        region.provider(),
                        region.addr(),
                        region.len()
                    );
                    let mut state = lock(&self.state);
                    for &entry in &detached[i..] {
                        state.insert_region(entry);
                    }
                    return;
                }
            }
        }
    }

    /// Extend the block at `ptr` to `new_size` bytes by absorbing the free
    /// block right after it. Returns false, changing nothing, when that space
    /// is not available.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero or overflowing size, `InvalidPointer` if
    /// `ptr` is not a live block.
    pub fn try_grow_in_place(&self, ptr: NonNull<u8>, new_size: usize) -> Result<bool> {
        let (new_size, _) = Self::normalize(new_size, BLOCK_QUANTUM)?;
        let addr = ptr.as_ptr() as usize;
        let mut state = lock(&self.state);
        let block = state.used_block(addr)?;
        if new_size <= block.len {
            return Ok(true);
        }

        let need = new_size - block.len;
        let next = addr + block.len;
        match state.blocks.get(&next) {
            Some(b) if !b.used && b.region == block.region && b.len >= need => {}
            _ => return Ok(false),
        }
        let Some(spare) = state.remove_free(next) else {
            return Ok(false);
        };
        if spare.len > need {
            state.insert_free(addr + new_size, spare.len - need, block.region);
        }
        state.blocks.insert(
            addr,
            Block {
                len: new_size,
                ..block
            },
        );
        state.used_bytes += need;
        stats::COARSE_USED_BYTES.add(need);
        Ok(true)
    }

    /// Give the tail of the block at `ptr` beyond `new_size` back as free
    /// space.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `new_size` is zero or larger than the block,
    /// `InvalidPointer` if `ptr` is not a live block.
    pub fn shrink_in_place(&self, ptr: NonNull<u8>, new_size: usize) -> Result<()> {
        let (new_size, _) = Self::normalize(new_size, BLOCK_QUANTUM)?;
        let addr = ptr.as_ptr() as usize;
        let mut state = lock(&self.state);
        let block = state.used_block(addr)?;
        if new_size > block.len {
            return Err(MemError::invalid(format!(
                "cannot shrink a {:#x}-byte block to {new_size:#x}",
                block.len
            )));
        }
        if new_size == block.len {
            return Ok(());
        }

        let tail = block.len - new_size;
        state.blocks.insert(
            addr,
            Block {
                len: new_size,
                ..block
            },
        );
        state.used_bytes -= tail;
        stats::COARSE_USED_BYTES.sub(tail);
        state.insert_coalesced(addr + new_size, tail, block.region);
        Ok(())
    }

    /// Usable length of the block at `ptr`.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` if `ptr` is not a live block.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let addr = ptr.as_ptr() as usize;
        Ok(lock(&self.state).used_block(addr)?.len)
    }

    #[must_use]
    pub fn stats(&self) -> CoarseStats {
        let state = lock(&self.state);
        CoarseStats {
            regions: state.regions.len(),
            region_bytes: state.region_bytes,
            used_bytes: state.used_bytes,
            free_bytes: state.free_by_size.iter().map(|&(len, _)| len).sum(),
            free_blocks: state.free_by_size.len(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CoarseSnapshot {
        let state = lock(&self.state);
        CoarseSnapshot {
            regions: state
                .regions
                .values()
                .map(|e| (e.region.addr(), e.region.len()))
                .collect(),
            blocks: state
                .blocks
                .iter()
                .map(|(&addr, b)| BlockInfo {
                    addr,
                    len: b.len,
                    region: b.region,
                    used: b.used,
                })
                .collect(),
        }
    }
}

impl Drop for CoarseAllocator {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let leaked = state.blocks.values().filter(|b| b.used).count();
        if leaked > 0 {
            log::warn!(
                "coarse: dropped with {leaked} live blocks ({} bytes) on {}",
                state.used_bytes,
                self.provider.name()
            );
        }
        stats::COARSE_USED_BYTES.sub(state.used_bytes);
        stats::COARSE_REGION_BYTES.sub(state.region_bytes);

        let entries: Vec<RegionEntry> = state
            .by_seq
            .values()
            .rev()
            .filter_map(|base| state.regions.get(base).copied())
            .collect();
        *state = CoarseState::default();
        drop(state);

        for entry in entries {
            if let Err(e) = self.provider.free(entry.region) {
                log::warn!(
                    "coarse: {} refused region {:#x} at teardown: {e}",
                    self.provider.name(),
                    entry.region.addr()
                );
            }
        }
    }
}
