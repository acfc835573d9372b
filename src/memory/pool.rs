//! Pool contract and the proxy pool.
//!
//! A pool is the malloc-shaped front end over a coarse allocator. Pools are
//! built from a provider handle only, so any pool kind composes with any
//! substrate.

use super::coarse::{CoarseAllocator, CoarseConfig};
use super::error::{MemError, Result};
use super::provider::MemoryProvider;
use super::scalable::{ScalablePool, ScalablePoolConfig};
use crate::sync::owner::Arc;
use std::ptr::NonNull;

/// General allocator interface shared by every pool kind.
///
/// All methods may be called concurrently from any thread.
pub trait MemoryPool: Send + Sync {
    /// Pool kind name (`"scalable"`, `"proxy"`).
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// `InvalidArgument` for a zero size, or whatever growth of the
    /// underlying coarse allocator reports.
    fn malloc(&self, size: usize) -> Result<NonNull<u8>>;

    /// Like [`malloc`](Self::malloc) with the start aligned to `align`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a non power-of-two `align`, plus the
    /// [`malloc`](Self::malloc) errors.
    fn aligned_malloc(&self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// `n * size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the product overflows, plus the
    /// [`malloc`](Self::malloc) errors.
    fn calloc(&self, n: usize, size: usize) -> Result<NonNull<u8>> {
        let total = n
            .checked_mul(size)
            .ok_or_else(|| MemError::invalid(format!("calloc({n}, {size}) overflows")))?;
        let ptr = self.malloc(total)?;
        // Safety: malloc returned at least `total` writable bytes.
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Ok(ptr)
    }

    /// Resize an allocation, keeping the first `min(old, new)` bytes.
    ///
    /// `None` behaves as `malloc(size)`. A zero `size` frees `ptr` and
    /// returns `None`. On error `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a live allocation of this pool, and must not
    /// be used after a successful call.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` if `ptr` is not live in this pool, plus the
    /// [`malloc`](Self::malloc) errors.
    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>>;

    /// # Safety
    ///
    /// `ptr` must not be used after a successful call.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` if `ptr` is not a live allocation of this pool; the
    /// pool is left unchanged.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Bytes usable at `ptr`, at least the size that was requested.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` if `ptr` is not a live allocation of this pool.
    fn malloc_usable_size(&self, ptr: NonNull<u8>) -> Result<usize>;

    /// Return cached memory to the coarse allocator where possible.
    fn trim(&self);

    fn provider(&self) -> &Arc<dyn MemoryProvider>;
}

/// Available pool kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Scalable,
    Proxy,
}

impl PoolKind {
    pub const ALL: [PoolKind; 2] = [PoolKind::Scalable, PoolKind::Proxy];
}

/// Build a pool of `kind` over `provider` with default configuration.
///
/// # Errors
///
/// Whatever the pool constructor reports.
pub fn create_pool(kind: PoolKind, provider: Arc<dyn MemoryProvider>) -> Result<Box<dyn MemoryPool>> {
    Ok(match kind {
        PoolKind::Scalable => Box::new(ScalablePool::with_config(provider, ScalablePoolConfig::default())?),
        PoolKind::Proxy => Box::new(ProxyPool::new(provider)),
    })
}

/// Pool that forwards every request to its coarse allocator.
pub struct ProxyPool {
    coarse: CoarseAllocator,
}

impl ProxyPool {
    #[must_use]
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Self {
        Self::with_config(provider, CoarseConfig::default())
    }

    #[must_use]
    pub fn with_config(provider: Arc<dyn MemoryProvider>, config: CoarseConfig) -> Self {
        Self {
            coarse: CoarseAllocator::with_config(provider, config),
        }
    }

    #[must_use]
    pub fn coarse(&self) -> &CoarseAllocator {
        &self.coarse
    }
}

/// Default alignment of `malloc` results.
pub const MIN_ALIGN: usize = 16;

impl MemoryPool for ProxyPool {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.coarse.allocate(size, MIN_ALIGN)
    }

    fn aligned_malloc(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.coarse.allocate(size, align)
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

        let old = self.coarse.usable_size(ptr)?;
        if size <= old {
            self.coarse.shrink_in_place(ptr, size)?;
            return Ok(Some(ptr));
        }
        if self.coarse.try_grow_in_place(ptr, size)? {
            return Ok(Some(ptr));
        }

        let new = self.coarse.allocate(size, MIN_ALIGN)?;
        // Safety: both blocks are live, distinct and at least `old` long.
        unsafe { new.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), old) };
        self.coarse.deallocate(ptr)?;
        Ok(Some(new))
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        self.coarse.deallocate(ptr)
    }

    fn malloc_usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.coarse.usable_size(ptr)
    }

    fn trim(&self) {}

    fn provider(&self) -> &Arc<dyn MemoryProvider> {
        self.coarse.provider()
    }
}
