use super::error::{MemError, Result};
use super::params::{FixedMemoryParams, FixedSource, Protection};
use super::provider::{MemoryProvider, ProviderCaps, Region, RegionLedger, ReleaseOrder, check_request};
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::{Mutex, lock};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

const NAME: &str = "fixed";

#[derive(Debug)]
struct FixedState {
    /// One bit per page; set while the page belongs to a live region.
    pages: FixedBitSet,
    ledger: RegionLedger,
}

/// Page-granular regions out of one buffer of fixed capacity.
///
/// Owned buffers are reserved up front and committed region by region;
/// borrowed buffers are used as they are.
pub struct FixedMemoryProvider {
    base: usize,
    len: usize,
    page: usize,
    owned: bool,
    state: Mutex<FixedState>,
}

impl FixedMemoryProvider {
    /// # Errors
    ///
    /// `Provider` if an owned buffer cannot be reserved.
    pub fn new(params: &FixedMemoryParams) -> Result<Self> {
        let page = PlatformVmOps::page_size();
        let (base, len, owned) = match params.source() {
            FixedSource::Owned { capacity } => {
                // Safety: FFI call to reserve address space.
                let ptr = unsafe { PlatformVmOps::reserve(capacity) }
                    .map_err(|e| MemError::provider(NAME, e))?;
                (ptr.as_ptr() as usize, capacity, true)
            }
            FixedSource::Borrowed { base, len } => (base, len, false),
        };

        log::debug!("fixed: {len:#x} bytes at {base:#x} (owned: {owned})");
        Ok(Self {
            base,
            len,
            page,
            owned,
            state: Mutex::new(FixedState {
                pages: FixedBitSet::with_capacity(len / page),
                ledger: RegionLedger::default(),
            }),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Pages not held by a live region.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        let state = lock(&self.state);
        state.pages.len() - state.pages.count_ones(..)
    }

    /// First free run of `count` pages whose address is aligned to `align`.
    /// Largest alignment met by some page start inside the buffer.
    fn max_align(&self) -> usize {
        let last = self.base + self.len - self.page;
        let best = match usize::BITS - (self.base ^ last).leading_zeros() {
            0 => self.base,
            // `last` has the highest differing bit set; clearing everything
            // below it stays within `base..=last`.
            spread => last & !((1usize << (spread - 1)) - 1),
        };
        1 << best.trailing_zeros()
    }

    fn find_run(&self, pages: &FixedBitSet, count: usize, align: usize) -> Result<usize> {
        let max = self.max_align();
        if align > max {
            return Err(MemError::AlignmentUnsupported { align, max });
        }
        let total = pages.len();
        let first = (self.base.next_multiple_of(align) - self.base) / self.page;
        if first + count > total {
            return Err(MemError::OutOfMemory);
        }
        let step = align / self.page;
        (first..=total - count)
            .step_by(step)
            .find(|&i| pages.count_ones(i..i + count) == 0)
            .ok_or(MemError::OutOfMemory)
    }
}

impl MemoryProvider for FixedMemoryProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn alloc(&self, size: usize, align: usize) -> Result<Region> {
        let (len, align) = check_request(size, align, self.page, 1 << (usize::BITS - 1))?;
        if len > self.len {
            return Err(MemError::OutOfMemory);
        }
        let count = len / self.page;

        let mut state = lock(&self.state);
        let index = self.find_run(&state.pages, count, align)?;
        // Safety: base is non-null and the run lies inside the buffer.
        let ptr = unsafe { NonNull::new_unchecked((self.base + index * self.page) as *mut u8) };
        if self.owned {
            // Safety: the run lies inside our reservation and is unused.
            unsafe { PlatformVmOps::commit(ptr, len, Protection::ReadWrite) }
                .map_err(|e| MemError::provider(NAME, e))?;
        }
        state.pages.set_range(index..index + count, true);

        let region = Region::new(ptr, len, NAME);
        state.ledger.insert(&region, index as u64);
        log::debug!("fixed: pages {index}..{} taken", index + count);
        Ok(region)
    }

    fn free(&self, region: Region) -> Result<()> {
        let mut state = lock(&self.state);
        let index = state.ledger.remove(&region)? as usize;
        if self.owned {
            // Safety: the ledger confirmed this range is a live region of ours.
            if let Err(e) = unsafe { PlatformVmOps::decommit(region.base(), region.len()) } {
                state.ledger.insert(&region, index as u64);
                return Err(MemError::provider(NAME, e));
            }
        }
        let count = region.len() / self.page;
        state.pages.set_range(index..index + count, false);
        log::debug!("fixed: pages {index}..{} returned", index + count);
        Ok(())
    }

    fn min_page_size(&self) -> usize {
        self.page
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            supports_growth: false,
            release_order: ReleaseOrder::Any,
        }
    }

    fn outstanding_regions(&self) -> usize {
        lock(&self.state).ledger.len()
    }
}

impl Drop for FixedMemoryProvider {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if !state.ledger.is_empty() {
            log::warn!("fixed: provider dropped with {} live regions", state.ledger.len());
        }
        state.ledger.drain();
        if self.owned {
            // Safety: the buffer was reserved in `new` with this length.
            if let Err(e) =
                unsafe { PlatformVmOps::release(NonNull::new_unchecked(self.base as *mut u8), self.len) }
            {
                log::warn!("fixed: failed to release buffer: {e}");
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::error::Status;

    fn owned(pages: usize) -> FixedMemoryProvider {
        let page = PlatformVmOps::page_size();
        FixedMemoryProvider::new(&FixedMemoryParams::new(pages * page).unwrap()).unwrap()
    }

    #[test]
    fn test_fixed_exhaustion_boundary() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = owned(8);
        let page = p.min_page_size();

        let a = p.alloc(4 * page, 8).unwrap();
        let b = p.alloc(4 * page, 8).unwrap();
        assert_eq!(p.free_pages(), 0);
        assert_eq!(p.alloc(1, 8).unwrap_err().status(), Status::OutOfMemory);
        assert_eq!(p.alloc(9 * page, 8).unwrap_err().status(), Status::OutOfMemory);

        p.free(a).unwrap();
        p.free(b).unwrap();
        assert_eq!(p.free_pages(), 8);
    }

    #[test]
    fn test_fixed_any_order_release_and_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = owned(6);
        let page = p.min_page_size();

        let a = p.alloc(2 * page, 8).unwrap();
        let b = p.alloc(2 * page, 8).unwrap();
        let c = p.alloc(2 * page, 8).unwrap();
        p.free(a).unwrap();
        p.free(c).unwrap();

        // Only two-page holes are left; a three-page run does not exist.
        assert_eq!(p.alloc(3 * page, 8).unwrap_err().status(), Status::OutOfMemory);
        let d = p.alloc(2 * page, 8).unwrap();
        assert_eq!(d.addr(), a.addr());
        // Safety: Test code, fixed regions are committed read-write.
        unsafe { d.base().as_ptr().write_bytes(7, d.len()) };

        p.free(b).unwrap();
        p.free(d).unwrap();
        assert_eq!(p.outstanding_regions(), 0);
    }

    #[test]
    fn test_fixed_alignment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = owned(64);
        let page = p.min_page_size();
        let align = 8 * page;

        let r = p.alloc(page, align).unwrap();
        assert_eq!(r.addr() % align, 0);
        p.free(r).unwrap();

        assert_eq!(
            p.alloc(page, 1 << 40).unwrap_err().status(),
            Status::AlignmentUnsupported
        );
    }

    #[test]
    fn test_fixed_capacity_short_of_aligned_run() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut buf = vec![0u8; page * 16];
        // Four pages starting one page past an eight-page boundary.
        let start = (buf.as_ptr() as usize).next_multiple_of(8 * page) + page;
        let ptr = NonNull::new(buf.as_mut_ptr().with_addr(start)).unwrap();
        // Safety: the four pages lie inside buf, which outlives the provider.
        let params = unsafe { FixedMemoryParams::from_raw(ptr, 4 * page).unwrap() };
        let p = FixedMemoryProvider::new(&params).unwrap();
        assert_eq!(p.max_align(), 4 * page);

        // Aligned starts exist, the buffer is just too short past them.
        assert_eq!(p.alloc(4 * page, 2 * page).unwrap_err().status(), Status::OutOfMemory);
        assert_eq!(p.alloc(2 * page, 4 * page).unwrap_err().status(), Status::OutOfMemory);
        // No page in the buffer sits on an eight-page boundary.
        let err = p.alloc(page, 8 * page).unwrap_err();
        assert!(
            matches!(err, MemError::AlignmentUnsupported { align, max } if align == 8 * page && max == 4 * page),
            "{err:?}"
        );

        let r = p.alloc(page, 4 * page).unwrap();
        assert_eq!(r.addr(), start + 3 * page);
        p.free(r).unwrap();
        assert_eq!(p.outstanding_regions(), 0);
    }

    #[test]
    fn test_fixed_borrowed_buffer() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut buf = vec![0u8; page * 5];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        // Safety: buf outlives the provider and is not touched while it lives.
        let params = unsafe { FixedMemoryParams::from_raw(ptr, buf.len()).unwrap() };
        let p = FixedMemoryProvider::new(&params).unwrap();
        assert!(p.capacity() >= page * 4);

        let r = p.alloc(page, 8).unwrap();
        let start = buf.as_ptr() as usize;
        assert!(r.addr() >= start && r.end() <= start + buf.len());
        // Safety: Test code.
        unsafe { r.base().as_ptr().write(9) };
        p.free(r).unwrap();
        drop(p);
        assert!(buf.contains(&9));
    }

    #[test]
    fn test_fixed_invalid_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = owned(4);
        let r = p.alloc(1, 8).unwrap();
        p.free(r).unwrap();
        assert_eq!(p.free(r).unwrap_err().status(), Status::InvalidPointer);
    }
}
