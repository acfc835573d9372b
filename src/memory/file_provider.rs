use super::error::{MemError, Result};
use super::params::{FileMemoryParams, Visibility};
use super::provider::{MemoryProvider, ProviderCaps, Region, RegionLedger, ReleaseOrder, check_request};
use super::vm::{FileMapping, PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, lock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

const NAME: &str = "file";

pub const MAX_FILE_ALIGN: usize = 1 << 30;

#[derive(Debug, Default)]
struct FileState {
    ledger: RegionLedger,
    /// Released file ranges, offset -> length. Never adjacent to each other
    /// and never touching `next_offset`.
    free_ranges: BTreeMap<u64, usize>,
    /// End of the highest range in use.
    next_offset: u64,
    /// Current length of the backing file. Never shrinks.
    file_len: u64,
}

impl FileState {
    /// First-fit reuse of a released range.
    fn take_free_range(&mut self, len: usize) -> Option<u64> {
        let (&offset, &avail) = self.free_ranges.iter().find(|&(_, &avail)| avail >= len)?;
        self.free_ranges.remove(&offset);
        if avail > len {
            self.free_ranges.insert(offset + len as u64, avail - len);
        }
        Some(offset)
    }

    fn return_range(&mut self, mut offset: u64, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.free_ranges.range(..offset).next_back()
            && prev + prev_len as u64 == offset
        {
            self.free_ranges.remove(&prev);
            offset = prev;
            len += prev_len;
        }
        let end = offset + len as u64;
        if let Some(next_len) = self.free_ranges.remove(&end) {
            len += next_len;
        }

        if offset + len as u64 == self.next_offset {
            self.next_offset = offset;
        } else {
            self.free_ranges.insert(offset, len);
        }
    }
}

/// Regions carved out of a memory-mapped backing file.
///
/// Each region maps its own file range. The file grows on demand and
/// released ranges are reused first-fit before the file is extended again.
pub struct FileMemoryProvider {
    params: FileMemoryParams,
    file: File,
    state: Mutex<FileState>,
}

impl FileMemoryProvider {
    /// Open (or create) the backing file.
    ///
    /// # Errors
    ///
    /// `Provider` if the file cannot be opened read-write.
    pub fn new(params: &FileMemoryParams) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(params.path())
            .map_err(|e| MemError::provider(NAME, VmError::BackingFailed(e)))?;
        let file_len = file
            .metadata()
            .map_err(|e| MemError::provider(NAME, VmError::BackingFailed(e)))?
            .len();

        log::debug!("file: opened {} ({file_len} bytes)", params.path().display());
        Ok(Self {
            params: params.clone(),
            file,
            state: Mutex::new(FileState {
                file_len,
                ..FileState::default()
            }),
        })
    }

    fn mapping(&self, offset: u64) -> FileMapping {
        FileMapping {
            fd: self.file.as_raw_fd(),
            offset,
            protection: self.params.protection(),
            shared: self.params.visibility() == Visibility::Shared,
        }
    }

    /// Map `len` bytes at `offset`, aligned to `align`.
    ///
    /// # Safety
    ///
    /// `offset..offset + len` must lie inside the file and belong to no
    /// other live region.
    unsafe fn map_range(&self, offset: u64, len: usize, align: usize) -> Result<NonNull<u8>> {
        let mapping = self.mapping(offset);
        if align <= PlatformVmOps::page_size() {
            // Safety: forwarded precondition.
            return unsafe { PlatformVmOps::map_file(mapping, len, None) }
                .map_err(|e| MemError::provider(NAME, e));
        }

        // Safety: FFI calls. The aligned reservation is replaced page for page
        // by the fixed file mapping, or released if the mapping fails.
        unsafe {
            let at = PlatformVmOps::reserve_aligned(len, align).map_err(|e| MemError::provider(NAME, e))?;
            PlatformVmOps::map_file(mapping, len, Some(at)).map_err(|e| {
                drop(PlatformVmOps::release(at, len));
                MemError::provider(NAME, e)
            })
        }
    }

    /// Bytes the backing file currently occupies.
    #[must_use]
    pub fn file_len(&self) -> u64 {
        lock(&self.state).file_len
    }
}

impl MemoryProvider for FileMemoryProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn alloc(&self, size: usize, align: usize) -> Result<Region> {
        let (len, align) = check_request(size, align, PlatformVmOps::page_size(), MAX_FILE_ALIGN)?;
        let mut state = lock(&self.state);

        let offset = match state.take_free_range(len) {
            Some(offset) => offset,
            None => {
                let offset = state.next_offset;
                let end = offset
                    .checked_add(len as u64)
                    .ok_or(MemError::OutOfMemory)?;
                if end > state.file_len {
                    self.file
                        .set_len(end)
                        .map_err(|e| MemError::provider(NAME, VmError::BackingFailed(e)))?;
                    state.file_len = end;
                }
                state.next_offset = end;
                offset
            }
        };

        // Safety: the range was just claimed under the state lock.
        let base = match unsafe { self.map_range(offset, len, align) } {
            Ok(base) => base,
            Err(e) => {
                state.return_range(offset, len);
                return Err(e);
            }
        };

        let region = Region::new(base, len, NAME);
        state.ledger.insert(&region, offset);
        log::debug!(
            "file: mapped offset {offset:#x}+{len:#x} at {:#x}",
            region.addr()
        );
        Ok(region)
    }

    fn free(&self, region: Region) -> Result<()> {
        let mut state = lock(&self.state);
        let offset = state.ledger.remove(&region)?;
        // Safety: the ledger confirmed this exact mapping is live and ours.
        if let Err(e) = unsafe { PlatformVmOps::release(region.base(), region.len()) } {
            state.ledger.insert(&region, offset);
            return Err(MemError::provider(NAME, e));
        }
        state.return_range(offset, region.len());
        log::debug!("file: unmapped offset {offset:#x}+{:#x}", region.len());
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
        lock(&self.state).ledger.len()
    }
}

impl Drop for FileMemoryProvider {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if !state.ledger.is_empty() {
            log::warn!(
                "file: provider for {} dropped with {} live regions",
                self.params.path().display(),
                state.ledger.len()
            );
        }
        for (base, len, _) in state.ledger.drain() {
            // Safety: drained entries are live mappings owned by this provider.
            unsafe {
                drop(PlatformVmOps::release(NonNull::new_unchecked(base as *mut u8), len));
            }
        }
    }
}
