#[cfg(not(target_pointer_width = "64"))]
compile_error!("strata supports only 64-bit targets.");

#[cfg(not(any(unix, loom, miri)))]
compile_error!("strata needs a unix VM layer (mmap).");

pub(crate) mod sync;

// public module: providers, coarse allocator, pools
// and TEST_MUTEX (public for tests)
pub mod memory;

// substrates
pub use memory::config::SubstrateConfig;
pub use memory::devdax_provider::DevDaxMemoryProvider;
pub use memory::file_provider::FileMemoryProvider;
pub use memory::fixed_provider::FixedMemoryProvider;
pub use memory::os_provider::OsMemoryProvider;
pub use memory::params::{
    DevDaxMemoryParams, FileMemoryParams, FixedMemoryParams, OsMemoryParams, Protection, Visibility,
};
pub use memory::provider::{MemoryProvider, ProviderCaps, Region, ReleaseOrder};

// allocators/pools
pub use memory::coarse::{BlockInfo, CoarseAllocator, CoarseConfig, CoarseSnapshot, CoarseStats};
pub use memory::pool::{MemoryPool, PoolKind, ProxyPool, create_pool};
pub use memory::scalable::{ScalablePool, ScalablePoolConfig};

// stats
pub use memory::stats::{MemoryStats, snapshot};

// errors
pub use memory::error::{MemError, Result, Status};
pub use memory::vm::VmError;
