//! The repository manifest: a single JSON object at a fixed remote key.
//!
//! The store is created once by `init` and read-modify-written by every
//! subsequent command. It is the only durable state in the core; crash safety
//! comes from writing intent (an orphan entry) before acting and clearing it
//! after.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::repository::backup::{Backup, BackupError, BackupId, Backups};
use crate::repository::orphan::{Orphan, OrphanReason, Orphans};
use crate::storage::{ObjectStore, StorageError};

pub const STORE_VERSION: u32 = 1;

/// Tolerated clock skew when checking the manifest creation timestamp.
fn clock_skew() -> TimeDelta {
    TimeDelta::minutes(5)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store version: {0}")]
    InvalidVersion(u32),

    #[error("store created in the future")]
    CreatedInFuture,

    #[error("backup {0} is in both backups and orphans")]
    BackupInOrphan(BackupId),

    #[error("backup validation failed")]
    BackupValidation(#[from] BackupError),

    #[error("backup {0} already exists with a different payload")]
    BackupExists(BackupId),

    #[error("orphan {0} already exists with a different payload")]
    OrphanExists(BackupId),

    #[error("backup not found: {0}")]
    BackupNotFound(BackupId),

    #[error("orphan not found: {0}")]
    OrphanNotFound(BackupId),

    #[error("failed to serialize store")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize store")]
    Deserialize(#[source] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Encryption settings persisted in the manifest so that every future
/// operation reuses the same recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub age: AgeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeConfig {
    pub recipient_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub backups: Backups,
    pub orphans: Orphans,
    pub encryption: EncryptionConfig,
    /// Sorted dataset names selected by glob at init time.
    pub managed_datasets: Vec<String>,
    /// Reserved for conditional-PUT support; always `None` in v1.
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl Store {
    pub fn new(encryption: EncryptionConfig, managed_datasets: Vec<String>) -> Self {
        Self {
            version: STORE_VERSION,
            created_at: Utc::now(),
            backups: Backups::new(),
            orphans: Orphans::new(),
            encryption,
            managed_datasets,
            hash: None,
        }
    }

    /// Read the manifest from the object store, deserialize and validate it.
    pub async fn load(storage: &dyn ObjectStore) -> Result<Self, StoreError> {
        debug!("Loading store");

        let content = storage.load_manifest().await?;
        let store: Store =
            serde_json::from_slice(&content).map_err(StoreError::Deserialize)?;
        store.validate()?;

        Ok(store)
    }

    /// Validate, serialize and write the manifest with a single PUT.
    pub async fn save(&self, storage: &dyn ObjectStore) -> Result<(), StoreError> {
        debug!("Saving store");

        self.validate()?;
        let content = serde_json::to_vec_pretty(self).map_err(StoreError::Serialize)?;
        storage.save_manifest(&content).await?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.version != STORE_VERSION {
            return Err(StoreError::InvalidVersion(self.version));
        }

        if self.created_at > Utc::now() + clock_skew() {
            return Err(StoreError::CreatedInFuture);
        }

        for id in self.orphans.keys() {
            if self.backups.contains(id) {
                return Err(StoreError::BackupInOrphan(*id));
            }
        }

        for backup in self.backups.iter() {
            self.backups.validate(backup.id)?;
        }

        Ok(())
    }

    /// Adding an entry whose payload is structurally equal is a no-op; adding
    /// a different payload under an existing key fails.
    pub fn add_backup(&mut self, backup: Backup) -> Result<(), StoreError> {
        if let Some(existing) = self.backups.get(&backup.id) {
            if *existing == backup {
                debug!(backup = %backup.id, "Backup already exists, skipping addition");
                return Ok(());
            }
            return Err(StoreError::BackupExists(backup.id));
        }

        self.backups.insert(backup);
        Ok(())
    }

    pub fn remove_backup(&mut self, id: BackupId) -> Result<Backup, StoreError> {
        self.backups
            .remove(&id)
            .map_err(|_| StoreError::BackupNotFound(id))
    }

    pub fn add_orphan(&mut self, backup: Backup, reason: OrphanReason) -> Result<(), StoreError> {
        let id = backup.id;
        let orphan = Orphan { backup, reason };

        if let Some(existing) = self.orphans.get(&id) {
            if *existing == orphan {
                debug!(backup = %id, "Orphan already exists, skipping addition");
                return Ok(());
            }
            return Err(StoreError::OrphanExists(id));
        }

        self.orphans.insert(id, orphan);
        Ok(())
    }

    pub fn remove_orphan(&mut self, id: BackupId) -> Result<Orphan, StoreError> {
        self.orphans.remove(&id).ok_or(StoreError::OrphanNotFound(id))
    }

    /// Set-difference between the stored managed datasets and the freshly
    /// expanded configured set. `None` when nothing changed.
    pub fn diff_managed_datasets(&self, configured: &[String]) -> Option<DatasetDiff> {
        use std::collections::BTreeSet;

        let managed: BTreeSet<&String> = self.managed_datasets.iter().collect();
        let expanded: BTreeSet<&String> = configured.iter().collect();

        let added: Vec<String> = expanded
            .difference(&managed)
            .map(|s| (*s).clone())
            .collect();
        let removed: Vec<String> = managed
            .difference(&expanded)
            .map(|s| (*s).clone())
            .collect();

        if added.is_empty() && removed.is_empty() {
            None
        } else {
            Some(DatasetDiff { added, removed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::backup::BackupKind;
    use ulid::Ulid;

    fn empty_store() -> Store {
        Store::new(
            EncryptionConfig {
                age: AgeConfig {
                    recipient_public_key: "age1testkey".to_string(),
                },
            },
            vec!["tank/home".to_string()],
        )
    }

    fn full_backup(dataset: &str) -> Backup {
        Backup {
            id: Ulid::new(),
            kind: BackupKind::Full,
            created_at: Utc::now() - TimeDelta::seconds(60),
            depends_on: None,
            dataset: dataset.to_string(),
            size: 42,
        }
    }

    #[test]
    fn test_validate_new_store() {
        assert!(empty_store().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let mut store = empty_store();
        store.version = 2;
        assert!(matches!(
            store.validate(),
            Err(StoreError::InvalidVersion(2))
        ));
    }

    #[test]
    fn test_validate_rejects_future_creation() {
        let mut store = empty_store();
        store.created_at = Utc::now() + TimeDelta::hours(1);
        assert!(matches!(store.validate(), Err(StoreError::CreatedInFuture)));
    }

    #[test]
    fn test_validate_rejects_backup_in_orphans() {
        let mut store = empty_store();
        let backup = full_backup("tank/home");
        store.add_backup(backup.clone()).unwrap();
        store.orphans.insert(
            backup.id,
            Orphan {
                backup: backup.clone(),
                reason: OrphanReason::Uncommitted,
            },
        );
        assert!(matches!(
            store.validate(),
            Err(StoreError::BackupInOrphan(id)) if id == backup.id
        ));
    }

    #[test]
    fn test_add_backup_idempotent_on_equal_payload() {
        let mut store = empty_store();
        let backup = full_backup("tank/home");

        store.add_backup(backup.clone()).unwrap();
        store.add_backup(backup.clone()).unwrap();
        assert_eq!(store.backups.len(), 1);
    }

    #[test]
    fn test_add_backup_rejects_different_payload() {
        let mut store = empty_store();
        let backup = full_backup("tank/home");
        store.add_backup(backup.clone()).unwrap();

        let mut changed = backup.clone();
        changed.size = 7;
        assert!(matches!(
            store.add_backup(changed),
            Err(StoreError::BackupExists(id)) if id == backup.id
        ));
    }

    #[test]
    fn test_add_orphan_idempotent_on_equal_payload() {
        let mut store = empty_store();
        let backup = full_backup("tank/home");

        store
            .add_orphan(backup.clone(), OrphanReason::Uncommitted)
            .unwrap();
        store
            .add_orphan(backup.clone(), OrphanReason::Uncommitted)
            .unwrap();
        assert_eq!(store.orphans.len(), 1);
    }

    #[test]
    fn test_add_orphan_rejects_different_reason() {
        let mut store = empty_store();
        let backup = full_backup("tank/home");

        store
            .add_orphan(backup.clone(), OrphanReason::Uncommitted)
            .unwrap();
        assert!(matches!(
            store.add_orphan(backup, OrphanReason::StartedDeletion),
            Err(StoreError::OrphanExists(_))
        ));
    }

    #[test]
    fn test_remove_missing_entries_fail() {
        let mut store = empty_store();
        let id = Ulid::new();
        assert!(matches!(
            store.remove_backup(id),
            Err(StoreError::BackupNotFound(_))
        ));
        assert!(matches!(
            store.remove_orphan(id),
            Err(StoreError::OrphanNotFound(_))
        ));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut store = empty_store();
        let full = full_backup("tank/home");
        let full_id = full.id;
        store.add_backup(full).unwrap();

        let diff = Backup {
            id: Ulid::new(),
            kind: BackupKind::Diff,
            created_at: Utc::now() - TimeDelta::seconds(30),
            depends_on: Some(full_id),
            dataset: "tank/home".to_string(),
            size: 9,
        };
        store.add_backup(diff).unwrap();
        store
            .add_orphan(full_backup("tank/home"), OrphanReason::StartedDeletion)
            .unwrap();

        let json = serde_json::to_vec_pretty(&store).unwrap();
        let decoded: Store = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, store);
    }

    #[test]
    fn test_manifest_field_names() {
        let mut store = empty_store();
        let backup = full_backup("tank/home");
        let id = backup.id;
        store.add_backup(backup).unwrap();

        let value: serde_json::Value =
            serde_json::to_value(&store).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["created_at"].is_string());
        assert_eq!(
            value["encryption"]["age"]["recipient_public_key"],
            "age1testkey"
        );
        assert_eq!(value["managed_datasets"][0], "tank/home");
        assert!(value["hash"].is_null());

        let entry = &value["backups"][id.to_string()];
        assert_eq!(entry["type"], "full");
        assert_eq!(entry["dataset"], "tank/home");
        assert_eq!(entry["size"], 42);
        assert!(entry["depends_on"].is_null());
    }

    #[test]
    fn test_diff_managed_datasets() {
        let store = empty_store();

        assert!(store
            .diff_managed_datasets(&["tank/home".to_string()])
            .is_none());

        let diff = store
            .diff_managed_datasets(&["tank/srv".to_string()])
            .unwrap();
        assert_eq!(diff.added, vec!["tank/srv".to_string()]);
        assert_eq!(diff.removed, vec!["tank/home".to_string()]);
    }
}
