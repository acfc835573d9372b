pub mod coarse;
pub mod config;
pub mod devdax_provider;
pub mod error;
pub mod file_provider;
pub mod fixed_provider;
pub mod os_provider;
pub mod params;
pub mod pool;
pub mod provider;
pub mod scalable;
pub mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
