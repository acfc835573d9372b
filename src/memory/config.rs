//! Substrate selection.
//!
//! `SubstrateConfig` names a provider kind together with its params and
//! builds the provider on demand. The `*_from_env` loaders are an optional
//! front door for harnesses that configure substrates through the
//! environment; nothing else in the crate reads environment variables.

use super::devdax_provider::DevDaxMemoryProvider;
use super::error::{MemError, Result};
use super::file_provider::FileMemoryProvider;
use super::fixed_provider::FixedMemoryProvider;
use super::os_provider::OsMemoryProvider;
use super::params::{DevDaxMemoryParams, FileMemoryParams, FixedMemoryParams, OsMemoryParams};
use super::provider::MemoryProvider;
use crate::sync::owner::Arc;
use std::ffi::OsString;

pub const DEVDAX_PATH_VAR: &str = "STRATA_DEVDAX_PATH";
pub const DEVDAX_SIZE_VAR: &str = "STRATA_DEVDAX_SIZE";
pub const FILE_PATH_VAR: &str = "STRATA_FILE_PATH";

#[derive(Clone, Debug)]
pub enum SubstrateConfig {
    Os(OsMemoryParams),
    File(FileMemoryParams),
    DevDax(DevDaxMemoryParams),
    Fixed(FixedMemoryParams),
}

impl SubstrateConfig {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SubstrateConfig::Os(_) => "os",
            SubstrateConfig::File(_) => "file",
            SubstrateConfig::DevDax(_) => "devdax",
            SubstrateConfig::Fixed(_) => "fixed",
        }
    }

    /// Construct the provider this config describes.
    ///
    /// # Errors
    ///
    /// Whatever the provider constructor reports.
    pub fn build_provider(&self) -> Result<Arc<dyn MemoryProvider>> {
        Ok(match self {
            SubstrateConfig::Os(p) => Arc::new(OsMemoryProvider::new(p)?),
            SubstrateConfig::File(p) => Arc::new(FileMemoryProvider::new(p)?),
            SubstrateConfig::DevDax(p) => Arc::new(DevDaxMemoryProvider::new(p)?),
            SubstrateConfig::Fixed(p) => Arc::new(FixedMemoryProvider::new(p)?),
        })
    }

    /// Devdax substrate from `STRATA_DEVDAX_PATH` and `STRATA_DEVDAX_SIZE`.
    ///
    /// Returns `Ok(None)` when either variable is unset or empty. The size
    /// accepts decimal or `0x` hexadecimal bytes.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the size does not parse or the params reject it.
    pub fn devdax_from_env() -> Result<Option<Self>> {
        Self::devdax_from(std::env::var_os(DEVDAX_PATH_VAR), std::env::var_os(DEVDAX_SIZE_VAR))
    }

    /// File substrate from `STRATA_FILE_PATH`. `Ok(None)` when unset or empty.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the params reject the path.
    pub fn file_from_env() -> Result<Option<Self>> {
        Self::file_from(std::env::var_os(FILE_PATH_VAR))
    }

    fn devdax_from(path: Option<OsString>, size: Option<OsString>) -> Result<Option<Self>> {
        let (Some(path), Some(size)) = (non_empty(path), non_empty(size)) else {
            return Ok(None);
        };
        let size = size
            .to_str()
            .and_then(parse_size)
            .ok_or_else(|| MemError::invalid(format!("{DEVDAX_SIZE_VAR}={size:?} is not a byte count")))?;
        Ok(Some(SubstrateConfig::DevDax(DevDaxMemoryParams::new(path, size)?)))
    }

    fn file_from(path: Option<OsString>) -> Result<Option<Self>> {
        match non_empty(path) {
            Some(path) => Ok(Some(SubstrateConfig::File(FileMemoryParams::new(path)?))),
            None => Ok(None),
        }
    }
}

fn non_empty(value: Option<OsString>) -> Option<OsString> {
    value.filter(|v| !v.is_empty())
}

fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;
    use crate::memory::error::Status;

    #[test]
    fn test_unset_variables_mean_unconfigured() {
        assert!(SubstrateConfig::devdax_from(None, None).unwrap().is_none());
        assert!(SubstrateConfig::devdax_from(Some("/dev/dax0.0".into()), None).unwrap().is_none());
        assert!(SubstrateConfig::devdax_from(Some("".into()), Some("4096".into())).unwrap().is_none());
        assert!(SubstrateConfig::file_from(Some("".into())).unwrap().is_none());
    }

    #[test]
    fn test_malformed_size_is_invalid() {
        let err = SubstrateConfig::devdax_from(Some("/dev/dax0.0".into()), Some("lots".into()))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        let err = SubstrateConfig::devdax_from(Some("/dev/dax0.0".into()), Some("0".into()))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_devdax_size_formats() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size(" 0x40000000 "), Some(1 << 30));
        assert_eq!(parse_size("-1"), None);

        let cfg = SubstrateConfig::devdax_from(Some("/dev/dax0.0".into()), Some("0x200000".into()))
            .unwrap()
            .unwrap();
        let SubstrateConfig::DevDax(params) = cfg else {
            panic!("expected devdax config");
        };
        assert_eq!(params.size(), 0x20_0000);
    }

    #[test]
    fn test_build_every_substrate() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dax = dir.path().join("dax.bin");
        std::fs::File::create(&dax).unwrap().set_len(1 << 20).unwrap();

        let configs = [
            SubstrateConfig::Os(OsMemoryParams::new()),
            SubstrateConfig::File(FileMemoryParams::new(dir.path().join("file.bin")).unwrap()),
            SubstrateConfig::DevDax(
                DevDaxMemoryParams::new(&dax, 1 << 20)
                    .unwrap()
                    .with_page_size(4096)
                    .unwrap(),
            ),
            SubstrateConfig::Fixed(FixedMemoryParams::new(1 << 20).unwrap()),
        ];
        for cfg in &configs {
            let provider = cfg.build_provider().unwrap();
            assert_eq!(provider.name(), cfg.name());
            let r = provider.alloc(100, 8).unwrap();
            provider.free(r).unwrap();
            assert_eq!(provider.outstanding_regions(), 0);
        }
    }
}
