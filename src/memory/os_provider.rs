use super::error::{MemError, Result};
use super::params::OsMemoryParams;
use super::provider::{MemoryProvider, ProviderCaps, Region, RegionLedger, ReleaseOrder, check_request};
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::{Mutex, lock};
use std::ptr::NonNull;

const NAME: &str = "os";

/// Largest alignment the over-reserve path will serve.
pub const MAX_OS_ALIGN: usize = 1 << 30;

/// Anonymous private memory straight from the OS.
///
/// Every region is its own mapping: reserved, committed with the configured
/// protection, and unmapped as a whole on release. Alignments above the page
/// size over-reserve and trim the slack (see `VmOps::reserve_aligned`).
pub struct OsMemoryProvider {
    params: OsMemoryParams,
    ledger: Mutex<RegionLedger>,
}

impl OsMemoryProvider {
    /// # Errors
    ///
    /// Infallible today; kept fallible so every provider shares one
    /// construction shape.
    pub fn new(params: &OsMemoryParams) -> Result<Self> {
        Ok(Self {
            params: params.clone(),
            ledger: Mutex::new(RegionLedger::default()),
        })
    }
}

impl MemoryProvider for OsMemoryProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn alloc(&self, size: usize, align: usize) -> Result<Region> {
        let (len, align) = check_request(size, align, PlatformVmOps::page_size(), MAX_OS_ALIGN)?;

        // Safety: FFI calls to reserve and commit memory. On commit failure
        // the reservation is released so nothing leaks into a retry.
        let base = unsafe {
            let base = PlatformVmOps::reserve_aligned(len, align)
                .map_err(|e| MemError::provider(NAME, e))?;
            if let Err(e) = PlatformVmOps::commit(base, len, self.params.protection()) {
                drop(PlatformVmOps::release(base, len));
                return Err(MemError::provider(NAME, e));
            }
            base
        };

        let region = Region::new(base, len, NAME);
        lock(&self.ledger).insert(&region, 0);
        log::debug!("os: mapped region {:#x}+{len:#x}", region.addr());
        Ok(region)
    }

    fn free(&self, region: Region) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        ledger.remove(&region)?;
        // Safety: the ledger confirmed this exact mapping is live and ours.
        if let Err(e) = unsafe { PlatformVmOps::release(region.base(), region.len()) } {
            ledger.insert(&region, 0);
            return Err(MemError::provider(NAME, e));
        }
        log::debug!("os: unmapped region {:#x}+{:#x}", region.addr(), region.len());
        Ok(())
    }

    fn min_page_size(&self) -> usize {
        PlatformVmOps::page_size()
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            supports_growth: true,
            release_order: ReleaseOrder::Any,
        }
    }

    fn outstanding_regions(&self) -> usize {
        lock(&self.ledger).len()
    }
}

impl Drop for OsMemoryProvider {
    fn drop(&mut self) {
        let mut ledger = lock(&self.ledger);
        if !ledger.is_empty() {
            log::warn!("os: provider dropped with {} live regions", ledger.len());
        }
        for (base, len, _) in ledger.drain() {
            // Safety: drained entries are live mappings owned by this provider.
            unsafe {
                drop(PlatformVmOps::release(NonNull::new_unchecked(base as *mut u8), len));
            }
        }
    }
}
