use super::error::{MemError, Result};
use super::params::DevDaxMemoryParams;
use super::provider::{MemoryProvider, ProviderCaps, Region, ReleaseOrder, check_request};
use super::stats;
use super::vm::{FileMapping, PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, lock};
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

const NAME: &str = "devdax";

#[derive(Clone, Copy, Debug)]
struct DaxRegion {
    offset: usize,
    len: usize,
    /// Bump cursor before this region was carved.
    prev_top: usize,
}

#[derive(Debug, Default)]
struct DaxState {
    top: usize,
    stack: Vec<DaxRegion>,
}

/// Device-DAX substrate.
///
/// The whole device is mapped shared once; regions are bump-allocated from
/// that mapping in `page_size` units and must be handed back newest first.
pub struct DevDaxMemoryProvider {
    base: usize,
    len: usize,
    page_size: usize,
    state: Mutex<DaxState>,
}

impl DevDaxMemoryProvider {
    /// Open and map the device.
    ///
    /// The mapped length is `size` rounded down to whole pages. A regular
    /// file can stand in for the device as long as it is at least that long.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `size` holds no whole page or a stand-in file
    ///   is too short.
    /// - `Provider` if the device cannot be opened or mapped.
    pub fn new(params: &DevDaxMemoryParams) -> Result<Self> {
        let page_size = params.page_size();
        let len = params.size() - params.size() % page_size;
        if len == 0 {
            return Err(MemError::invalid(format!(
                "devdax size {:#x} is smaller than its page size {page_size:#x}",
                params.size()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(params.path())
            .map_err(|e| MemError::provider(NAME, VmError::BackingFailed(e)))?;
        let meta = file
            .metadata()
            .map_err(|e| MemError::provider(NAME, VmError::BackingFailed(e)))?;
        if meta.is_file() && meta.len() < len as u64 {
            return Err(MemError::invalid(format!(
                "{} holds {} bytes, devdax size is {len}",
                params.path().display(),
                meta.len()
            )));
        }

        let mapping = FileMapping {
            fd: file.as_raw_fd(),
            offset: 0,
            protection: params.protection(),
            shared: true,
        };
        // Safety: FFI calls. The aligned reservation is replaced by the device
        // mapping, or released if the mapping fails.
        let base = unsafe {
            let at = PlatformVmOps::reserve_aligned(len, page_size)
                .map_err(|e| MemError::provider(NAME, e))?;
            PlatformVmOps::map_file(mapping, len, Some(at)).map_err(|e| {
                drop(PlatformVmOps::release(at, len));
                MemError::provider(NAME, e)
            })?
        };

        log::debug!(
            "devdax: mapped {} ({len:#x} bytes, page {page_size:#x}) at {:#x}",
            params.path().display(),
            base.as_ptr() as usize
        );
        Ok(Self {
            base: base.as_ptr() as usize,
            len,
            page_size,
            state: Mutex::new(DaxState::default()),
        })
    }

    /// Mapped device bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Bytes not yet carved.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len - lock(&self.state).top
    }
}

impl MemoryProvider for DevDaxMemoryProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn alloc(&self, size: usize, align: usize) -> Result<Region> {
        let max_align = self.len.next_power_of_two();
        let (len, align) = check_request(size, align, self.page_size, max_align)?;
        let mut state = lock(&self.state);

        let offset = (self.base + state.top).next_multiple_of(align) - self.base;
        let end = offset.checked_add(len).ok_or(MemError::OutOfMemory)?;
        if end > self.len {
            return Err(MemError::OutOfMemory);
        }
        let prev_top = state.top;
        state.stack.push(DaxRegion {
            offset,
            len,
            prev_top,
        });
        state.top = end;
        stats::PROVIDER_MAPPED.add(len);
        stats::PROVIDER_REGIONS.add(1);

        // Safety: base is the non-null address of the device mapping.
        let ptr = unsafe { NonNull::new_unchecked((self.base + offset) as *mut u8) };
        log::debug!("devdax: carved {offset:#x}+{len:#x}");
        Ok(Region::new(ptr, len, NAME))
    }

    fn free(&self, region: Region) -> Result<()> {
        let mut state = lock(&self.state);
        let Some(offset) = region.addr().checked_sub(self.base) else {
            return Err(MemError::InvalidPointer(region.addr()));
        };
        let pos = state
            .stack
            .iter()
            .rposition(|r| r.offset == offset && r.len == region.len())
            .ok_or(MemError::InvalidPointer(region.addr()))?;
        if pos + 1 != state.stack.len() {
            return Err(MemError::NotSupported(
                "devdax regions must be released newest first",
            ));
        }

        let top = state.stack.pop().map_or(0, |r| r.prev_top);
        state.top = top;
        stats::PROVIDER_MAPPED.sub(region.len());
        stats::PROVIDER_REGIONS.sub(1);
        log::debug!("devdax: returned {offset:#x}+{:#x}", region.len());
        Ok(())
    }

    fn min_page_size(&self) -> usize {
        self.page_size
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            supports_growth: false,
            release_order: ReleaseOrder::Lifo,
        }
    }

    fn outstanding_regions(&self) -> usize {
        lock(&self.state).stack.len()
    }
}

impl Drop for DevDaxMemoryProvider {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if !state.stack.is_empty() {
            log::warn!("devdax: provider dropped with {} live regions", state.stack.len());
            for r in &state.stack {
                stats::PROVIDER_MAPPED.sub(r.len);
                stats::PROVIDER_REGIONS.sub(1);
            }
        }
        // Safety: the device mapping was created in `new` with this length.
        if let Err(e) =
            unsafe { PlatformVmOps::release(NonNull::new_unchecked(self.base as *mut u8), self.len) }
        {
            log::warn!("devdax: failed to unmap device: {e}");
        }
    }
}
