use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use thiserror::Error;

/// Huge page size. Devdax mappings default to this granularity.
pub const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("file mapping failed: {0}")]
    MapFailed(#[source] io::Error),
    #[error("backing store failed: {0}")]
    BackingFailed(#[source] io::Error),
}

impl VmError {
    fn io(&self) -> &io::Error {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e)
            | VmError::MapFailed(e)
            | VmError::BackingFailed(e) => e,
        }
    }

    /// True when the OS refused for lack of memory, address space or
    /// backing-store capacity.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        let e = self.io();
        e.kind() == io::ErrorKind::OutOfMemory
            || matches!(
                e.raw_os_error(),
                Some(libc::ENOMEM | libc::ENOSPC | libc::EFBIG)
            )
    }
}

/// Access rights for committed and mapped pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protection {
    Read,
    #[default]
    ReadWrite,
}

impl Protection {
    fn prot_flags(self) -> libc::c_int {
        match self {
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// How a file range is mapped into the address space.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FileMapping {
    pub fd: RawFd,
    pub offset: u64,
    pub protection: Protection,
    /// `MAP_SHARED` when true, `MAP_PRIVATE` otherwise.
    pub shared: bool,
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Reserve `size` bytes whose start is aligned to `align`.
    ///
    /// `align` must be a power of two. The returned range is released with
    /// [`release`](VmOps::release) using the same `size`; no padding remains
    /// attached to it.
    unsafe fn reserve_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: Protection) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Map `size` bytes of a file. With `at`, the mapping replaces the pages
    /// of an existing reservation starting at that address.
    unsafe fn map_file(
        mapping: FileMapping,
        size: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{FileMapping, NonNull, PlatformVmOps, Protection, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn reserve_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            let page_size = Self::page_size();
            if align <= page_size {
                // Safety: forwarded precondition.
                return unsafe { Self::reserve(size) };
            }

            // Over-reserve: in the worst case the base sits (align - page_size)
            // bytes before the next aligned boundary.
            let total = size
                .checked_add(align - page_size)
                .ok_or_else(|| VmError::ReservationFailed(io::Error::from(io::ErrorKind::InvalidInput)))?;
            // Safety: FFI call to reserve memory.
            let base = unsafe { Self::reserve(total)? };
            let base_addr = base.as_ptr() as usize;
            let aligned_addr = base_addr.next_multiple_of(align);
            let head = aligned_addr - base_addr;
            let tail = total - head - size;

            // Trim the slack so the aligned range stands alone. A failed trim
            // leaves address space mapped; release everything and report.
            // Safety: head and tail lie inside the reservation made above.
            unsafe {
                if head > 0
                    && let Err(e) = Self::release(base, head)
                {
                    drop(Self::release(base, total));
                    return Err(e);
                }
                if tail > 0 {
                    let tail_ptr = NonNull::new_unchecked((aligned_addr + size) as *mut u8);
                    if let Err(e) = Self::release(tail_ptr, tail) {
                        drop(Self::release(NonNull::new_unchecked(aligned_addr as *mut u8), size + tail));
                        return Err(e);
                    }
                }
                Ok(NonNull::new_unchecked(aligned_addr as *mut u8))
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: Protection) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    protection.prot_flags(),
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Transparent Huge Pages: only worth advising for ranges that
                // can hold at least one huge page.
                if size >= super::PAGE_SIZE_2MB {
                    // Safety: FFI call to madvise.
                    unsafe {
                        libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_HUGEPAGE)
                    };
                }
            }

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_DONTNEED drops the pages of private anonymous mappings
            // immediately; mprotect(PROT_NONE) removes access until the next
            // commit.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_DONTNEED) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn map_file(
            mapping: FileMapping,
            size: usize,
            at: Option<NonNull<u8>>,
        ) -> Result<NonNull<u8>, VmError> {
            let offset = libc::off_t::try_from(mapping.offset)
                .map_err(|_| VmError::MapFailed(io::Error::from(io::ErrorKind::InvalidInput)))?;
            let mut flags = if mapping.shared {
                libc::MAP_SHARED
            } else {
                libc::MAP_PRIVATE
            };
            let hint = match at {
                Some(p) => {
                    flags |= libc::MAP_FIXED;
                    p.as_ptr().cast::<libc::c_void>()
                }
                None => std::ptr::null_mut(),
            };

            // Safety: FFI call to mmap. With MAP_FIXED the caller owns the
            // reservation being replaced.
            let ptr = unsafe {
                libc::mmap(hint, size, mapping.protection.prot_flags(), flags, mapping.fd, offset)
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Instead we back every "reservation"
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`).
// The layout of each live reservation is remembered so `release` can hand the
// exact layout back to the heap.
//
// `commit` / `decommit` are no-ops: the memory is always accessible once
// reserved. File mappings are unsupported.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
mod mock {
    use super::{FileMapping, NonNull, PlatformVmOps, Protection, VmError, VmOps};
    use std::alloc::Layout;
    use std::collections::HashMap;
    use std::io;

    const MOCK_PAGE: usize = 4096;

    // Plain std Mutex: bookkeeping for the mock itself, not a modeled lock.
    fn live() -> std::sync::MutexGuard<'static, HashMap<usize, Layout>> {
        static LIVE: std::sync::OnceLock<std::sync::Mutex<HashMap<usize, Layout>>> =
            std::sync::OnceLock::new();
        LIVE.get_or_init(Default::default)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: forwarded precondition.
            unsafe { Self::reserve_aligned(size, MOCK_PAGE) }
        }

        unsafe fn reserve_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            if size == 0 {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size reservation",
                )));
            }
            let layout = Layout::from_size_align(size, align.max(MOCK_PAGE))
                .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "alloc returned null",
                ))
            })?;
            live().insert(ptr.as_ptr() as usize, layout);
            Ok(ptr)
        }

        unsafe fn commit(_ptr: NonNull<u8>, _size: usize, _protection: Protection) -> Result<(), VmError> {
            Ok(())
        }

        unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            let Some(layout) = live().remove(&(ptr.as_ptr() as usize)) else {
                return Err(VmError::ReleaseFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "partial or unknown mock release",
                )));
            };
            // Safety: ptr was allocated with this layout via `reserve_aligned`.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            Ok(())
        }

        unsafe fn map_file(
            _mapping: FileMapping,
            _size: usize,
            _at: Option<NonNull<u8>>,
        ) -> Result<NonNull<u8>, VmError> {
            Err(VmError::MapFailed(io::Error::new(
                io::ErrorKind::Unsupported,
                "file mappings are not available under the heap-backed VM mock",
            )))
        }

        fn page_size() -> usize {
            MOCK_PAGE
        }
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_decommit_then_recommit() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");
            *(ptr.as_ptr()) = 42;
            assert_eq!(*(ptr.as_ptr().cast_const()), 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Recommit failed");

            *(ptr.as_ptr()) = 84;
            assert_eq!(*(ptr.as_ptr().cast_const()), 84);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "Page size {size} is not power of two");
    }

    #[test]
    fn test_reserve_aligned_respects_alignment() {
        let page = PlatformVmOps::page_size();
        for align in [page, page * 4, PAGE_SIZE_2MB] {
            let size = page * 3;
            // Safety: Test code.
            unsafe {
                let ptr = PlatformVmOps::reserve_aligned(size, align).expect("reserve_aligned failed");
                assert_eq!(ptr.as_ptr() as usize % align, 0, "align {align:#x}");
                PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");
                *ptr.as_ptr().add(size - 1) = 7;
                // The range must stand alone: releasing exactly `size` frees it.
                PlatformVmOps::release(ptr, size).expect("Release failed");
            }
        }
    }

    #[test]
    fn test_multiple_reservations() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");
            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size, Protection::ReadWrite).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size, Protection::ReadWrite).expect("Commit 2 failed");
            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");
            assert_eq!(*(ptr2.as_ptr()), 2);
            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }

    #[test]
    fn test_map_file_shared_roundtrip() {
        let page = PlatformVmOps::page_size();
        let file = tempfile::tempfile().unwrap();
        file.set_len((page * 2) as u64).unwrap();
        let mapping = FileMapping {
            fd: file.as_raw_fd(),
            offset: page as u64,
            protection: Protection::ReadWrite,
            shared: true,
        };
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map_file(mapping, page, None).expect("map_file failed");
            *ptr.as_ptr() = 0x5A;
            PlatformVmOps::release(ptr, page).expect("Release failed");

            // A second mapping of the same offset observes the shared write.
            let again = PlatformVmOps::map_file(mapping, page, None).expect("remap failed");
            assert_eq!(*again.as_ptr(), 0x5A);
            PlatformVmOps::release(again, page).expect("Release failed");
        }
    }

    #[test]
    fn test_map_file_fixed_over_reservation() {
        let page = PlatformVmOps::page_size();
        let file = tempfile::tempfile().unwrap();
        file.set_len(page as u64).unwrap();
        let mapping = FileMapping {
            fd: file.as_raw_fd(),
            offset: 0,
            protection: Protection::ReadWrite,
            shared: true,
        };
        // Safety: Test code.
        unsafe {
            let at = PlatformVmOps::reserve_aligned(page, page * 16).unwrap();
            let ptr = PlatformVmOps::map_file(mapping, page, Some(at)).expect("fixed map failed");
            assert_eq!(ptr, at);
            *ptr.as_ptr() = 1;
            PlatformVmOps::release(ptr, page).unwrap();
        }
    }

    #[test]
    fn test_enomem_classification() {
        let oom = VmError::ReservationFailed(io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(oom.is_out_of_memory());
        let other = VmError::ReleaseFailed(io::Error::from_raw_os_error(libc::EINVAL));
        assert!(!other.is_out_of_memory());
    }
}
