//! Provider contract.
//!
//! A provider hands out whole coarse regions from one substrate and takes
//! them back whole. It knows nothing about how a region is subdivided.

use super::error::{MemError, Result};
use super::stats;
use std::collections::HashMap;
use std::ptr::NonNull;

/// A contiguous range handed out by a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
    provider: &'static str,
}

// Safety: a Region is a plain address-range descriptor. Ownership of the
// memory it names travels with it; it grants no access on its own.
unsafe impl Send for Region {}
// Safety: see above.
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn new(base: NonNull<u8>, len: usize, provider: &'static str) -> Self {
        Self { base, len, provider }
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.addr() + self.len
    }

    #[must_use]
    pub fn provider(&self) -> &'static str {
        self.provider
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.end()
    }
}

/// Order in which a provider accepts regions back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOrder {
    /// Any region may be released at any time.
    Any,
    /// Only the most recently acquired live region may be released.
    Lifo,
}

/// Substrate constraints a coarse allocator must respect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProviderCaps {
    /// The substrate can keep handing out memory without a fixed capacity.
    pub supports_growth: bool,
    pub release_order: ReleaseOrder,
}

/// Capability interface every substrate implements.
///
/// Implementations synchronize internally: every method may be called from
/// any thread without an external lock, and no method calls back into an
/// allocator built on top of the provider.
pub trait MemoryProvider: Send + Sync {
    /// Substrate name (`"os"`, `"file"`, `"devdax"`, `"fixed"`).
    fn name(&self) -> &'static str;

    /// Acquire a region of at least `size` bytes whose base is aligned to
    /// `max(align, min_page_size())`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero size, a non power-of-two alignment or a
    ///   size that overflows page rounding.
    /// - `AlignmentUnsupported` when the substrate cannot honor `align`.
    /// - `OutOfMemory` when the substrate is exhausted.
    /// - `Provider` for any other substrate failure. A failed acquisition
    ///   leaves nothing mapped, so it is always safe to retry.
    fn alloc(&self, size: usize, align: usize) -> Result<Region>;

    /// Release a region previously returned by [`alloc`](Self::alloc) on this
    /// provider, as a whole.
    ///
    /// # Errors
    ///
    /// - `InvalidPointer` if the region was not issued by this provider or
    ///   is already released.
    /// - `NotSupported` if the release order is violated.
    /// - `Provider` if the substrate refused; the region stays live.
    fn free(&self, region: Region) -> Result<()>;

    /// Substrate granularity; every region length is a multiple of it.
    fn min_page_size(&self) -> usize;

    /// Preferred region size for a request of `size` bytes.
    fn recommended_page_size(&self, size: usize) -> usize {
        size.checked_next_multiple_of(self.min_page_size())
            .unwrap_or(size)
    }

    fn caps(&self) -> ProviderCaps;

    /// Live regions. Zero once every consumer has been torn down.
    fn outstanding_regions(&self) -> usize;
}

/// Validate an acquisition request and round it to the substrate page.
///
/// Returns `(len, align)` where `len` is a page multiple and `align` is at
/// least `page`.
pub(crate) fn check_request(
    size: usize,
    align: usize,
    page: usize,
    max_align: usize,
) -> Result<(usize, usize)> {
    if size == 0 {
        return Err(MemError::invalid("region size must be positive"));
    }
    if !align.is_power_of_two() {
        return Err(MemError::invalid(format!(
            "alignment {align:#x} is not a power of two"
        )));
    }
    let align = align.max(page);
    if align > max_align {
        return Err(MemError::AlignmentUnsupported { align, max: max_align });
    }
    let len = size
        .checked_next_multiple_of(page)
        .ok_or_else(|| MemError::invalid(format!("region size {size:#x} overflows")))?;
    Ok((len, align))
}

/// Live-region bookkeeping shared by the providers.
///
/// Keyed by base address. `tag` carries provider-specific data (the file
/// offset for file-backed regions). Keeps the global provider gauges in step.
#[derive(Debug, Default)]
pub(crate) struct RegionLedger {
    live: HashMap<usize, (usize, u64)>,
}

impl RegionLedger {
    pub fn insert(&mut self, region: &Region, tag: u64) {
        let prev = self.live.insert(region.addr(), (region.len(), tag));
        debug_assert!(prev.is_none(), "region {:#x} issued twice", region.addr());
        stats::PROVIDER_MAPPED.add(region.len());
        stats::PROVIDER_REGIONS.add(1);
    }

    /// Forget a region. Fails unless base and length match a live entry.
    pub fn remove(&mut self, region: &Region) -> Result<u64> {
        match self.live.get(&region.addr()) {
            Some(&(len, tag)) if len == region.len() => {
                self.live.remove(&region.addr());
                stats::PROVIDER_MAPPED.sub(len);
                stats::PROVIDER_REGIONS.sub(1);
                Ok(tag)
            }
            _ => Err(MemError::InvalidPointer(region.addr())),
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Remove and return every live region as `(base, len, tag)`.
    pub fn drain(&mut self) -> Vec<(usize, usize, u64)> {
        let drained: Vec<_> = self
            .live
            .drain()
            .map(|(base, (len, tag))| (base, len, tag))
            .collect();
        for &(_, len, _) in &drained {
            stats::PROVIDER_MAPPED.sub(len);
            stats::PROVIDER_REGIONS.sub(1);
        }
        drained
    }
}
