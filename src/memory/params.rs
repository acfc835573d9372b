//! Substrate parameters.
//!
//! Every provider kind has its own params type with the same shape: a
//! validating constructor, validating `with_*` setters, and plain `Drop` as
//! destruction. Params are immutable values; a provider copies what it needs
//! at construction, so dropping params never affects providers built from
//! them and one params value can build any number of providers.

use super::error::{MemError, Result};
use super::vm::{PAGE_SIZE_2MB, PlatformVmOps, VmOps};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

pub use super::vm::Protection;

/// Whether writes through a file mapping reach the backing file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Shared,
    Private,
}

/// Anonymous OS memory.
#[derive(Clone, Debug, Default)]
pub struct OsMemoryParams {
    protection: Protection,
}

impl OsMemoryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }
}

/// Memory-mapped file. The file is created if it does not exist and grows
/// as regions are carved from it.
#[derive(Clone, Debug)]
pub struct FileMemoryParams {
    path: PathBuf,
    visibility: Visibility,
    protection: Protection,
}

impl FileMemoryParams {
    /// # Errors
    ///
    /// `InvalidArgument` if `path` is empty.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(MemError::invalid("file path must not be empty"));
        }
        Ok(Self {
            path,
            visibility: Visibility::default(),
            protection: Protection::default(),
        })
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }
}

/// Device-DAX character device (or a file of fixed size standing in for
/// one), mapped shared as a whole.
#[derive(Clone, Debug)]
pub struct DevDaxMemoryParams {
    path: PathBuf,
    size: usize,
    page_size: usize,
    protection: Protection,
}

impl DevDaxMemoryParams {
    /// # Errors
    ///
    /// `InvalidArgument` if `path` is empty or `size` is zero.
    pub fn new(path: impl Into<PathBuf>, size: usize) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(MemError::invalid("devdax path must not be empty"));
        }
        if size == 0 {
            return Err(MemError::invalid("devdax size must be positive"));
        }
        Ok(Self {
            path,
            size,
            page_size: PAGE_SIZE_2MB,
            protection: Protection::default(),
        })
    }

    /// Granularity and minimum alignment of regions carved from the device.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless `page_size` is a power of two no smaller than
    /// the OS page and no larger than the device.
    pub fn with_page_size(mut self, page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size < PlatformVmOps::page_size() {
            return Err(MemError::invalid(format!(
                "devdax page size {page_size:#x} must be a power of two >= {:#x}",
                PlatformVmOps::page_size()
            )));
        }
        if page_size > self.size {
            return Err(MemError::invalid(format!(
                "devdax page size {page_size:#x} exceeds device size {:#x}",
                self.size
            )));
        }
        self.page_size = page_size;
        Ok(self)
    }

    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FixedSource {
    /// The provider maps `capacity` bytes itself.
    Owned { capacity: usize },
    /// Caller-owned buffer, already trimmed to whole OS pages.
    Borrowed { base: usize, len: usize },
}

/// Fixed-capacity buffer.
#[derive(Clone, Debug)]
pub struct FixedMemoryParams {
    source: FixedSource,
}

impl FixedMemoryParams {
    /// Buffer of `capacity` bytes mapped by the provider, rounded up to whole
    /// pages.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `capacity` is zero or overflows page rounding.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MemError::invalid("fixed capacity must be positive"));
        }
        let capacity = capacity
            .checked_next_multiple_of(PlatformVmOps::page_size())
            .ok_or_else(|| MemError::invalid(format!("fixed capacity {capacity:#x} overflows")))?;
        Ok(Self {
            source: FixedSource::Owned { capacity },
        })
    }

    /// Caller-owned buffer. Only the whole OS pages inside `[ptr, ptr + len)`
    /// are used.
    ///
    /// # Safety
    ///
    /// The buffer must be valid for reads and writes for `len` bytes and must
    /// outlive every provider built from these params, and no other code may
    /// access it while such a provider hands it out.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the buffer does not contain a whole page.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Result<Self> {
        let page = PlatformVmOps::page_size();
        let start = ptr.as_ptr() as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| MemError::invalid("fixed buffer wraps the address space"))?;
        let base = start
            .checked_next_multiple_of(page)
            .ok_or_else(|| MemError::invalid("fixed buffer wraps the address space"))?;
        let limit = end - end % page;
        if limit <= base {
            return Err(MemError::invalid(format!(
                "fixed buffer of {len:#x} bytes holds no whole page"
            )));
        }
        Ok(Self {
            source: FixedSource::Borrowed { base, len: limit - base },
        })
    }

    /// Usable bytes after page trimming.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match self.source {
            FixedSource::Owned { capacity } => capacity,
            FixedSource::Borrowed { len, .. } => len,
        }
    }

    pub(crate) fn source(&self) -> FixedSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::error::Status;

    #[test]
    fn test_file_params_reject_empty_path() {
        let err = FileMemoryParams::new("").unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_file_params_setters() {
        let p = FileMemoryParams::new("/tmp/strata.bin")
            .unwrap()
            .with_visibility(Visibility::Private)
            .with_protection(Protection::Read);
        assert_eq!(p.visibility(), Visibility::Private);
        assert_eq!(p.protection(), Protection::Read);
        assert_eq!(p.path(), Path::new("/tmp/strata.bin"));
    }

    #[test]
    fn test_devdax_params_validation() {
        assert_eq!(
            DevDaxMemoryParams::new("", 1 << 30).unwrap_err().status(),
            Status::InvalidArgument
        );
        assert_eq!(
            DevDaxMemoryParams::new("/dev/dax0.0", 0).unwrap_err().status(),
            Status::InvalidArgument
        );

        let p = DevDaxMemoryParams::new("/dev/dax0.0", 1 << 30).unwrap();
        assert_eq!(p.page_size(), PAGE_SIZE_2MB);
        assert_eq!(
            p.clone().with_page_size(3 * 4096).unwrap_err().status(),
            Status::InvalidArgument
        );
        assert_eq!(
            p.clone().with_page_size(1 << 31).unwrap_err().status(),
            Status::InvalidArgument
        );
        let page = PlatformVmOps::page_size();
        assert_eq!(p.with_page_size(page).unwrap().page_size(), page);
    }

    #[test]
    fn test_fixed_params_round_to_pages() {
        let page = PlatformVmOps::page_size();
        assert_eq!(FixedMemoryParams::new(1).unwrap().capacity(), page);
        assert_eq!(
            FixedMemoryParams::new(0).unwrap_err().status(),
            Status::InvalidArgument
        );
        assert_eq!(
            FixedMemoryParams::new(usize::MAX).unwrap_err().status(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_fixed_params_from_raw_trims_partial_pages() {
        let page = PlatformVmOps::page_size();
        let mut buf = vec![0u8; page * 4];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        // Safety: buf outlives the params and nothing else uses it.
        let p = unsafe { FixedMemoryParams::from_raw(ptr, buf.len()).unwrap() };
        let FixedSource::Borrowed { base, len } = p.source() else {
            panic!("expected a borrowed source");
        };
        assert_eq!(base % page, 0);
        assert_eq!(len % page, 0);
        assert!(len >= page * 3);

        // Safety: as above.
        let tiny = unsafe { FixedMemoryParams::from_raw(ptr, 16) };
        assert_eq!(tiny.unwrap_err().status(), Status::InvalidArgument);
    }

    #[test]
    fn test_params_are_values() {
        let p = FileMemoryParams::new("/tmp/a").unwrap();
        let copy = p.clone().with_visibility(Visibility::Private);
        drop(p);
        assert_eq!(copy.visibility(), Visibility::Private);
    }
}
