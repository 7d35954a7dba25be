//! Backup manifest entries and the parent/child chain rules.
//!
//! Chains are at most two levels deep: an incremental depends on a diff,
//! which depends on a full. Validation resolves and enforces the whole chain
//! on every call; `depends_on` is an ID lookup into the map, never a pointer.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::ExpiryConfig;

pub type BackupId = Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Diff,
    Incr,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Diff => "diff",
            BackupKind::Incr => "incr",
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "diff" => Ok(BackupKind::Diff),
            "incr" => Ok(BackupKind::Incr),
            other => Err(BackupError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub depends_on: Option<BackupId>,
    pub dataset: String,
    /// Bytes actually streamed to the remote; 0 until the upload completes.
    pub size: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackupError {
    #[error("backup created in the future")]
    CreatedInFuture,

    #[error("full backup depends on a parent backup")]
    FullHasParent,

    #[error("diff backup does not depend on a parent backup")]
    DiffNoParent,

    #[error("diff backup depends on a parent backup that is not a full backup")]
    DiffParentNotFull,

    #[error("incremental backup does not depend on a parent backup")]
    IncrNoParent,

    #[error("incremental backup depends on a parent backup that is not a diff backup")]
    IncrParentNotDiff,

    #[error("unknown backup kind: {0}")]
    UnknownKind(String),

    #[error("backup ID mismatch")]
    IdMismatch,

    #[error("parent backup not found")]
    ParentNotFound,
}

/// The backup arena, keyed by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Backups(pub BTreeMap<BackupId, Backup>);

impl Backups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &BackupId) -> Option<&Backup> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &BackupId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backup> {
        self.0.values()
    }

    pub fn insert(&mut self, backup: Backup) {
        self.0.insert(backup.id, backup);
    }

    pub fn remove(&mut self, id: &BackupId) -> Result<Backup, BackupError> {
        debug!(backup = %id, "Removing backup");
        self.0.remove(id).ok_or(BackupError::ParentNotFound)
    }

    /// Validates the backup identified by `id` and, recursively, its parent
    /// chain up to the root full backup.
    pub fn validate(&self, id: BackupId) -> Result<(), BackupError> {
        debug!(backup = %id, "Validating backup");

        let backup = self.get(&id).ok_or(BackupError::ParentNotFound)?;

        if backup.id != id {
            return Err(BackupError::IdMismatch);
        }

        if backup.created_at > Utc::now() {
            return Err(BackupError::CreatedInFuture);
        }

        match backup.kind {
            BackupKind::Full => {
                if backup.depends_on.is_some() {
                    return Err(BackupError::FullHasParent);
                }
                Ok(())
            }
            BackupKind::Diff => {
                let parent_id = backup.depends_on.ok_or(BackupError::DiffNoParent)?;
                let parent = self.get(&parent_id).ok_or(BackupError::ParentNotFound)?;
                if parent.kind != BackupKind::Full {
                    return Err(BackupError::DiffParentNotFull);
                }
                self.validate(parent_id)
            }
            BackupKind::Incr => {
                let parent_id = backup.depends_on.ok_or(BackupError::IncrNoParent)?;
                let parent = self.get(&parent_id).ok_or(BackupError::ParentNotFound)?;
                if parent.kind != BackupKind::Diff {
                    return Err(BackupError::IncrParentNotDiff);
                }
                self.validate(parent_id)
            }
        }
    }

    /// Returns true if the backup is expired. Backups expire when their TTL
    /// lapses or when any ancestor is expired; a child cannot outlive its
    /// parent.
    pub fn expired(&self, id: BackupId, expiry: &ExpiryConfig) -> Result<bool, BackupError> {
        self.validate(id)?;

        let backup = self.get(&id).ok_or(BackupError::ParentNotFound)?;
        let ttl = ttl_delta(expiry, backup.kind);
        let own_expired = backup.created_at < Utc::now() - ttl;

        match backup.depends_on {
            None => Ok(own_expired),
            Some(parent_id) => Ok(own_expired || self.expired(parent_id, expiry)?),
        }
    }

    /// Remaining time before the backup expires: the minimum of its own TTL
    /// and the parent's. Negative once expired. Informational only.
    pub fn time_till_expiry(
        &self,
        id: BackupId,
        expiry: &ExpiryConfig,
    ) -> Result<TimeDelta, BackupError> {
        self.validate(id)?;

        let backup = self.get(&id).ok_or(BackupError::ParentNotFound)?;
        let own = backup.created_at + ttl_delta(expiry, backup.kind) - Utc::now();

        match backup.depends_on {
            None => Ok(own),
            Some(parent_id) => Ok(own.min(self.time_till_expiry(parent_id, expiry)?)),
        }
    }

    pub fn expired_for_dataset(
        &self,
        dataset: &str,
        expiry: &ExpiryConfig,
    ) -> Result<Vec<Backup>, BackupError> {
        debug!(dataset, "Gathering expired backups");

        let mut expired = Vec::new();
        for backup in self.iter().filter(|b| b.dataset == dataset) {
            if self.expired(backup.id, expiry)? {
                expired.push(backup.clone());
            }
        }
        Ok(expired)
    }

    pub fn latest_full(&self, dataset: &str) -> Option<&Backup> {
        self.latest_of_kind(dataset, BackupKind::Full)
    }

    pub fn latest_diff(&self, dataset: &str) -> Option<&Backup> {
        self.latest_of_kind(dataset, BackupKind::Diff)
    }

    pub fn latest_incr(&self, dataset: &str) -> Option<&Backup> {
        self.latest_of_kind(dataset, BackupKind::Incr)
    }

    fn latest_of_kind(&self, dataset: &str, kind: BackupKind) -> Option<&Backup> {
        self.iter()
            .filter(|b| b.kind == kind && b.dataset == dataset)
            .max_by_key(|b| b.created_at)
    }

    /// The parent a new backup of `kind` would depend on: none for full, the
    /// latest full for diff, the latest diff for incr.
    pub fn parent_for(
        &self,
        dataset: &str,
        kind: BackupKind,
    ) -> Result<Option<&Backup>, BackupError> {
        match kind {
            BackupKind::Full => Ok(None),
            BackupKind::Diff => self
                .latest_full(dataset)
                .map(Some)
                .ok_or(BackupError::ParentNotFound),
            BackupKind::Incr => self
                .latest_diff(dataset)
                .map(Some)
                .ok_or(BackupError::ParentNotFound),
        }
    }

    /// Direct children only. Incrementals have no children by contract.
    pub fn children(&self, id: BackupId) -> Vec<&Backup> {
        let Some(backup) = self.get(&id) else {
            warn!(backup = %id, "Backup not found while looking up children");
            return Vec::new();
        };

        if backup.kind == BackupKind::Incr {
            return Vec::new();
        }

        self.iter().filter(|b| b.depends_on == Some(id)).collect()
    }

    /// Transitive children.
    pub fn all_children(&self, id: BackupId) -> Vec<&Backup> {
        let mut result = self.children(id);
        let direct: Vec<BackupId> = result.iter().map(|b| b.id).collect();
        for child_id in direct {
            result.extend(self.all_children(child_id));
        }
        result
    }
}

impl<'a> IntoIterator for &'a Backups {
    type Item = &'a Backup;
    type IntoIter = std::collections::btree_map::Values<'a, BackupId, Backup>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}

fn ttl_delta(expiry: &ExpiryConfig, kind: BackupKind) -> TimeDelta {
    TimeDelta::from_std(expiry.for_kind(kind)).unwrap_or(TimeDelta::MAX)
}
