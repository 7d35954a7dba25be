//! Orphan entries: backups whose remote state is uncertain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::repository::backup::{Backup, BackupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// The upload never completed; the remote object may not exist.
    Uncommitted,
    /// A deletion is mid-flight; the remote object may or may not still exist.
    StartedDeletion,
}

pub type Orphans = BTreeMap<BackupId, Orphan>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orphan {
    pub backup: Backup,
    pub reason: OrphanReason,
}

impl Orphan {
    pub fn safe_to_delete(&self) -> bool {
        self.reason == OrphanReason::Uncommitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::backup::BackupKind;
    use chrono::Utc;
    use ulid::Ulid;

    fn orphan(reason: OrphanReason) -> Orphan {
        Orphan {
            backup: Backup {
                id: Ulid::new(),
                kind: BackupKind::Full,
                created_at: Utc::now(),
                depends_on: None,
                dataset: "tank/home".to_string(),
                size: 0,
            },
            reason,
        }
    }

    #[test]
    fn test_safe_to_delete() {
        assert!(orphan(OrphanReason::Uncommitted).safe_to_delete());
        assert!(!orphan(OrphanReason::StartedDeletion).safe_to_delete());
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&OrphanReason::StartedDeletion).unwrap();
        assert_eq!(json, "\"started_deletion\"");
        let json = serde_json::to_string(&OrphanReason::Uncommitted).unwrap();
        assert_eq!(json, "\"uncommitted\"");
    }
}
