pub mod backup;
pub mod commands;
pub mod keys;
pub mod lock;
pub mod options;
pub mod restore;
pub mod wrapper;

#[cfg(test)]
pub(crate) mod testing;

pub use backup::BackupReport;
pub use lock::LockInfo;
pub use options::{BackupOptions, DumpOptions, KeyOptions, RestoreOptions, SetupOptions};
pub use restore::RestoreReport;
pub use wrapper::{ResticWrapper, WrapperConfig};
