//! Repository model: the manifest store, backups and orphans.

mod backup;
mod orphan;
mod store;

pub use backup::{Backup, BackupError, BackupId, BackupKind, Backups};
pub use orphan::{Orphan, OrphanReason, Orphans};
pub use store::{
    AgeConfig, DatasetDiff, EncryptionConfig, Store, StoreError, STORE_VERSION,
};
