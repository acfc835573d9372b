use super::vm::VmError;
use thiserror::Error;

/// Uniform failure type returned by providers, the coarse allocator and pools.
#[derive(Debug, Error)]
pub enum MemError {
    /// The provider is exhausted or the substrate capacity is reached.
    #[error("out of memory")]
    OutOfMemory,

    /// Malformed size, alignment or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The substrate cannot hand out memory at the requested alignment.
    #[error("alignment {align:#x} unsupported (maximum {max:#x})")]
    AlignmentUnsupported { align: usize, max: usize },

    /// Free, realloc or size query on an address no live allocation owns.
    #[error("invalid pointer {0:#x}")]
    InvalidPointer(usize),

    /// Substrate-specific failure, wrapped with the name of the provider.
    #[error("{provider} provider failed: {source}")]
    Provider {
        provider: &'static str,
        #[source]
        source: VmError,
    },

    /// The provider/pool combination cannot perform the operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}

pub type Result<T> = std::result::Result<T, MemError>;

/// Flat status taxonomy, one value per outcome kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    OutOfMemory,
    InvalidArgument,
    AlignmentUnsupported,
    InvalidPointer,
    ProviderError,
    NotSupported,
}

impl Status {
    /// Collapse any result into its status code.
    #[must_use]
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => e.status(),
        }
    }
}

impl MemError {
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::OutOfMemory => Status::OutOfMemory,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::AlignmentUnsupported { .. } => Status::AlignmentUnsupported,
            Self::InvalidPointer(_) => Status::InvalidPointer,
            Self::Provider { .. } => Status::ProviderError,
            Self::NotSupported(_) => Status::NotSupported,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn provider(provider: &'static str, source: VmError) -> Self {
        // The OS reporting ENOMEM is plain exhaustion, not a substrate fault.
        if source.is_out_of_memory() {
            return Self::OutOfMemory;
        }
        Self::Provider { provider, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Status::of(&Ok::<(), MemError>(())), Status::Success);
        assert_eq!(MemError::OutOfMemory.status(), Status::OutOfMemory);
        assert_eq!(MemError::invalid("x").status(), Status::InvalidArgument);
        assert_eq!(
            MemError::AlignmentUnsupported { align: 8, max: 4 }.status(),
            Status::AlignmentUnsupported
        );
        assert_eq!(MemError::InvalidPointer(0x10).status(), Status::InvalidPointer);
        assert_eq!(MemError::NotSupported("grow").status(), Status::NotSupported);
    }

    #[test]
    fn test_provider_enomem_collapses_to_oom() {
        let e = MemError::provider(
            "os",
            VmError::ReservationFailed(std::io::Error::from_raw_os_error(libc::ENOMEM)),
        );
        assert_eq!(e.status(), Status::OutOfMemory);

        let e = MemError::provider(
            "file",
            VmError::MapFailed(std::io::Error::from_raw_os_error(libc::EACCES)),
        );
        assert_eq!(e.status(), Status::ProviderError);
        assert!(e.to_string().starts_with("file provider failed"));
    }

    #[test]
    fn test_display() {
        let e = MemError::AlignmentUnsupported { align: 0x1000, max: 0x10 };
        assert_eq!(e.to_string(), "alignment 0x1000 unsupported (maximum 0x10)");
        assert_eq!(MemError::InvalidPointer(0xdead).to_string(), "invalid pointer 0xdead");
    }
}
