//! Per-backup delete state machine and its drivers.
//!
//! Deletion reverses the backup lifecycle: the entry moves from `backups` to
//! `orphans` (reason `started_deletion`) before the remote object is touched,
//! so a crash mid-delete leaves a resumable orphan instead of a dangling
//! manifest entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::ExpiryConfig;
use crate::fsm::{Fsm, RetryPolicy, Transition, TransitionError, TransitionFuture};
use crate::repository::{Backup, BackupKind, OrphanReason};
use crate::runner::{Runner, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteState {
    Initial,
    PrerequisitesVerified,
    Orphaned,
    RemoteRemoved,
    UpdatedStore,
    ReleasedSnapshot,
    LocalRemoved,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteAction {
    VerifyPrerequisites,
    ForceSkipPrerequisites,
    DryRun,
    Orphan,
    DoNotOrphan,
    RemoveRemote,
    SkipRemoveRemote,
    UpdateStore,
    ReleaseSnapshot,
    SkipLocalRemoval,
    RemoveLocal,
    Complete,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOpts {
    pub skip_prerequisites_verification: bool,
    pub skip_orphaning: bool,
    pub skip_local_snapshot_removal: bool,
    pub skip_remote_snapshot_removal: bool,
    pub dry_run: bool,
}

pub struct DeleteFsmData {
    pub dataset: String,
    pub backup: Backup,
    /// True when the entry was already in the orphan list.
    pub orphan: bool,
}

type DeleteFsm = Fsm<DeleteState, DeleteAction, DeleteFsmData>;

fn delete_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 5,
        wait_increment: Duration::from_secs(2),
        max_wait: Duration::from_secs(10),
    }
}

impl Runner {
    /// Delete every orphan entry. Orphaning is skipped since the entries are
    /// already orphans.
    pub async fn delete_all_orphans(&self, mut opts: DeleteOpts) -> Result<(), RunnerError> {
        debug!(?opts, "Deleting all orphans");
        opts.skip_orphaning = true;

        let orphans: Vec<Backup> = {
            let store = self.store.lock().await;
            store.orphans.values().map(|o| o.backup.clone()).collect()
        };

        for backup in orphans {
            debug!(orphan = %backup.id, "Deleting orphan");
            self.delete(&backup.dataset, backup.id, opts).await?;
        }

        Ok(())
    }

    /// Delete expired backups across all managed datasets.
    pub async fn delete_all_expired(
        &self,
        opts: DeleteOpts,
        expiry: &ExpiryConfig,
    ) -> Result<(), RunnerError> {
        debug!(?opts, "Deleting all expired backups");

        let datasets = self.store.lock().await.managed_datasets.clone();
        for dataset in datasets {
            self.delete_expired(&dataset, opts, expiry).await?;
        }

        Ok(())
    }

    /// Delete expired backups of one dataset, children before parents.
    pub async fn delete_expired(
        &self,
        dataset: &str,
        opts: DeleteOpts,
        expiry: &ExpiryConfig,
    ) -> Result<(), RunnerError> {
        let mut expired = {
            let store = self.store.lock().await;
            store.backups.expired_for_dataset(dataset, expiry)?
        };

        if expired.is_empty() {
            info!(dataset, "No expired backups found");
            return Ok(());
        }

        // Descending ID order deletes the newest first, which ships children
        // to the orphan list before their parent's prerequisite check runs.
        expired.sort_by(|a, b| b.id.cmp(&a.id));

        debug!(dataset, count = expired.len(), "Deleting expired backups");
        for backup in expired {
            self.delete(dataset, backup.id, opts).await?;
        }

        Ok(())
    }

    /// Delete a backup and all its transitive children, children first.
    pub fn delete_recursive<'a>(
        &'a self,
        dataset: &'a str,
        id: Ulid,
        opts: DeleteOpts,
    ) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + 'a>> {
        Box::pin(async move {
            debug!(dataset, backup = %id, "Deleting backup recursively");

            let children: Vec<Ulid> = {
                let store = self.store.lock().await;
                store.backups.children(id).iter().map(|b| b.id).collect()
            };

            for child in children {
                self.delete_recursive(dataset, child, opts).await?;
            }

            self.delete(dataset, id, opts).await
        })
    }

    /// Delete a single backup by driving its state machine.
    pub async fn delete(
        &self,
        dataset: &str,
        id: Ulid,
        opts: DeleteOpts,
    ) -> Result<(), RunnerError> {
        debug!(dataset, backup = %id, ?opts, "Deleting backup");

        let fsm = self.create_delete_fsm(dataset, id).await?;

        let mut actions = Vec::new();
        actions.push(if opts.skip_prerequisites_verification {
            DeleteAction::ForceSkipPrerequisites
        } else {
            DeleteAction::VerifyPrerequisites
        });

        if opts.dry_run {
            actions.push(DeleteAction::DryRun);
            return fsm
                .run_sequence(actions)
                .await
                .map_err(|source| RunnerError::DeleteFailed { id, source });
        }

        actions.push(if opts.skip_orphaning {
            DeleteAction::DoNotOrphan
        } else {
            DeleteAction::Orphan
        });
        actions.push(if opts.skip_remote_snapshot_removal {
            DeleteAction::SkipRemoveRemote
        } else {
            DeleteAction::RemoveRemote
        });
        actions.push(DeleteAction::UpdateStore);
        if opts.skip_local_snapshot_removal {
            actions.push(DeleteAction::SkipLocalRemoval);
        } else {
            actions.push(DeleteAction::ReleaseSnapshot);
            actions.push(DeleteAction::RemoveLocal);
        }
        actions.push(DeleteAction::Complete);

        fsm.run_sequence(actions)
            .await
            .map_err(|source| RunnerError::DeleteFailed { id, source })
    }

    async fn create_delete_fsm(&self, dataset: &str, id: Ulid) -> Result<DeleteFsm, RunnerError> {
        debug!(dataset, backup = %id, "Creating delete FSM");

        let (backup, orphan) = {
            let store = self.store.lock().await;
            match store.backups.get(&id) {
                Some(backup) => (backup.clone(), false),
                None => match store.orphans.get(&id) {
                    Some(orphan) => (orphan.backup.clone(), true),
                    None => return Err(RunnerError::BackupNotFound(id)),
                },
            }
        };

        if backup.dataset != dataset {
            return Err(RunnerError::DatasetMismatch {
                id,
                dataset: dataset.to_string(),
            });
        }

        let data = DeleteFsmData {
            dataset: dataset.to_string(),
            backup,
            orphan,
        };

        let mut transitions = HashMap::new();

        transitions.insert(
            DeleteAction::VerifyPrerequisites,
            Transition::new(DeleteState::Initial, DeleteState::PrerequisitesVerified, {
                let runner = self.clone();
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        if data.orphan {
                            debug!(backup = %data.backup.id, "Skipping prerequisites verification for orphan");
                            return Ok(());
                        }

                        let children = {
                            let store = runner.store.lock().await;
                            store
                                .backups
                                .children(data.backup.id)
                                .iter()
                                .map(|b| b.id)
                                .collect::<Vec<_>>()
                        };

                        if !children.is_empty() {
                            return Err(TransitionError::unrecoverable_msg(format!(
                                "backup {} has dependent backups: {children:?}",
                                data.backup.id
                            )));
                        }

                        debug!(backup = %data.backup.id, "Prerequisites verified");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::ForceSkipPrerequisites,
            Transition::new(DeleteState::Initial, DeleteState::PrerequisitesVerified, {
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        warn!(backup = %data.backup.id, "Skipping prerequisites verification");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::DryRun,
            Transition::new(DeleteState::PrerequisitesVerified, DeleteState::Completed, {
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        warn!(backup = %data.backup.id, "Dry run, not mutating anything");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::Orphan,
            Transition::new(DeleteState::PrerequisitesVerified, DeleteState::Orphaned, {
                let runner = self.clone();
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(backup = %data.backup.id, "Orphaning backup");

                        {
                            let mut store = runner.store.lock().await;
                            store
                                .remove_backup(data.backup.id)
                                .map_err(TransitionError::unrecoverable)?;
                            store
                                .add_orphan(data.backup.clone(), OrphanReason::StartedDeletion)
                                .map_err(TransitionError::unrecoverable)?;
                        }

                        runner
                            .save_store()
                            .await
                            .map_err(TransitionError::retryable)?;

                        debug!(backup = %data.backup.id, "Backup orphaned");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::DoNotOrphan,
            Transition::new(DeleteState::PrerequisitesVerified, DeleteState::Orphaned, {
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        // Only legitimate when the entry is already an
                        // orphan; otherwise the manifest would lose its
                        // crash-safety marker.
                        if !data.orphan {
                            return Err(TransitionError::unrecoverable_msg(format!(
                                "refusing to skip orphaning for non-orphan backup {}",
                                data.backup.id
                            )));
                        }
                        warn!(backup = %data.backup.id, "Skipping orphaning for orphan entry");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::RemoveRemote,
            Transition::new(DeleteState::Orphaned, DeleteState::RemoteRemoved, {
                let runner = self.clone();
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(backup = %data.backup.id, "Removing backup from remote");

                        runner
                            .storage
                            .delete_snapshot_object(&data.dataset, &data.backup.id.to_string())
                            .await
                            .map_err(TransitionError::retryable)?;

                        debug!(backup = %data.backup.id, "Snapshot removed from remote store");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::SkipRemoveRemote,
            Transition::new(DeleteState::Orphaned, DeleteState::RemoteRemoved, {
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        warn!(backup = %data.backup.id, "Skipping removal of remote snapshot object");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::UpdateStore,
            Transition::new(DeleteState::RemoteRemoved, DeleteState::UpdatedStore, {
                let runner = self.clone();
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(backup = %data.backup.id, "Updating store");

                        {
                            let mut store = runner.store.lock().await;
                            store
                                .remove_orphan(data.backup.id)
                                .map_err(TransitionError::retryable)?;
                        }

                        runner
                            .save_store()
                            .await
                            .map_err(TransitionError::retryable)?;

                        debug!(backup = %data.backup.id, "Store updated");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::ReleaseSnapshot,
            Transition::new(DeleteState::UpdatedStore, DeleteState::ReleasedSnapshot, {
                let runner = self.clone();
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(backup = %data.backup.id, "Releasing snapshot hold");

                        let result = runner
                            .provider
                            .release_snapshot(&data.dataset, data.backup.id, true)
                            .await;

                        if let Err(err) = result {
                            // Incrementals never had a hold; for the rest a
                            // leaked hold only blocks local destruction.
                            if data.backup.kind == BackupKind::Incr {
                                debug!(backup = %data.backup.id, "No hold to release for incremental");
                            } else {
                                warn!(backup = %data.backup.id, error = %err, "Failed to release snapshot hold, continuing");
                            }
                        }

                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::SkipLocalRemoval,
            Transition::new(DeleteState::UpdatedStore, DeleteState::LocalRemoved, {
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        warn!(backup = %data.backup.id, "Skipping local snapshot removal");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::RemoveLocal,
            Transition::new(DeleteState::ReleasedSnapshot, DeleteState::LocalRemoved, {
                let runner = self.clone();
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(backup = %data.backup.id, "Destroying local snapshot");

                        runner
                            .provider
                            .delete_snapshot(&data.dataset, data.backup.id)
                            .await
                            .map_err(TransitionError::retryable)?;

                        debug!(backup = %data.backup.id, "Local snapshot destroyed");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            DeleteAction::Complete,
            Transition::new(DeleteState::LocalRemoved, DeleteState::Completed, {
                move |data: &mut DeleteFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        info!(dataset = %data.dataset, backup = %data.backup.id, "Deletion completed");
                        Ok(())
                    })
                }
            }),
        );

        Ok(Fsm::new(
            "delete",
            DeleteState::Initial,
            data,
            transitions,
            delete_retry_policy(),
            self.shutdown.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::backup::BackupAction;
    use super::*;
    use crate::fsm::FsmError;
    use crate::testutil::TestEnv;
    use chrono::{TimeDelta, Utc};

    async fn backup_chain(runner: &Runner) -> (Ulid, Ulid, Ulid) {
        // ULIDs created within the same millisecond do not sort by creation
        // order; space the backups out so ID order matches chain order.
        runner.backup_all_managed(BackupKind::Full).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        runner.backup_all_managed(BackupKind::Diff).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        runner.backup_all_managed(BackupKind::Incr).await.unwrap();

        let store = runner.store.lock().await;
        let full = store.backups.latest_full("tank/home").unwrap().id;
        let diff = store.backups.latest_diff("tank/home").unwrap().id;
        let incr = store.backups.latest_incr("tank/home").unwrap().id;
        (full, diff, incr)
    }

    fn short_expiry() -> ExpiryConfig {
        ExpiryConfig {
            full: Duration::from_secs(0),
            diff: Duration::from_secs(0),
            incr: Duration::from_secs(0),
        }
    }

    #[tokio::test]
    async fn test_delete_leaf_backup() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (_, _, incr) = backup_chain(&runner).await;

        runner
            .delete("tank/home", incr, DeleteOpts::default())
            .await
            .unwrap();

        let store = runner.store.lock().await;
        assert_eq!(store.backups.len(), 2);
        assert!(store.orphans.is_empty());
        assert!(env.storage.object("tank/home", &incr.to_string()).is_none());
        assert!(!env.provider.has_snapshot("tank/home", incr));
    }

    #[tokio::test]
    async fn test_delete_parent_with_children_refused() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (full, _, _) = backup_chain(&runner).await;

        let err = runner
            .delete("tank/home", full, DeleteOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::DeleteFailed {
                source: FsmError::Unrecoverable(_),
                ..
            }
        ));

        // Nothing was mutated.
        let store = runner.store.lock().await;
        assert_eq!(store.backups.len(), 3);
        assert!(store.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (_, _, incr) = backup_chain(&runner).await;

        runner
            .delete(
                "tank/home",
                incr,
                DeleteOpts {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let store = runner.store.lock().await;
        assert_eq!(store.backups.len(), 3);
        assert!(env.storage.object("tank/home", &incr.to_string()).is_some());
        assert!(env.provider.has_snapshot("tank/home", incr));
    }

    #[tokio::test]
    async fn test_skip_orphaning_refused_for_non_orphan() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (_, _, incr) = backup_chain(&runner).await;

        let err = runner
            .delete(
                "tank/home",
                incr,
                DeleteOpts {
                    skip_orphaning: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::DeleteFailed {
                source: FsmError::Unrecoverable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_crash_during_upload_leaves_recoverable_orphan() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;

        // Simulate a crash after upload but before update_store.
        let fsm = runner
            .create_backup_fsm(BackupKind::Full, "tank/home")
            .await
            .unwrap();
        fsm.run_sequence([
            BackupAction::GetParent,
            BackupAction::CreateSnapshot,
            BackupAction::CreateManifest,
            BackupAction::AddOrphan,
            BackupAction::UploadSnapshot,
        ])
        .await
        .unwrap();
        drop(fsm);

        {
            let store = runner.store.lock().await;
            assert_eq!(store.orphans.len(), 1);
            assert!(store.backups.is_empty());
        }

        // cleanup --orphans sweeps the orphan and the remote object.
        runner
            .delete_all_orphans(DeleteOpts::default())
            .await
            .unwrap();

        let store = runner.store.lock().await;
        assert!(store.orphans.is_empty());
        assert!(store.backups.is_empty());
        assert_eq!(env.storage.object_count(), 0);
    }

    #[tokio::test]
    async fn test_expiry_cascade_deletes_children_first() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (full, diff, incr) = backup_chain(&runner).await;

        // Age the full beyond its TTL; children remain within their own TTLs
        // but expire through the cascade.
        {
            let mut store = runner.store.lock().await;
            let mut backup = store.backups.get(&full).unwrap().clone();
            backup.created_at = Utc::now() - TimeDelta::hours(336) - TimeDelta::seconds(1);
            store.backups.insert(backup);
        }

        let expiry = ExpiryConfig {
            full: Duration::from_secs(336 * 3600),
            diff: Duration::from_secs(120 * 3600),
            incr: Duration::from_secs(24 * 3600),
        };

        runner
            .delete_expired("tank/home", DeleteOpts::default(), &expiry)
            .await
            .unwrap();

        let store = runner.store.lock().await;
        assert!(store.backups.is_empty());
        assert!(store.orphans.is_empty());

        // Strictly descending ID order: incr, diff, full.
        let deletions = env.storage.deletions();
        assert_eq!(
            deletions,
            vec![
                format!("snaps/tank/home/{incr}"),
                format!("snaps/tank/home/{diff}"),
                format!("snaps/tank/home/{full}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_recursive_children_first() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (full, diff, incr) = backup_chain(&runner).await;

        runner
            .delete_recursive("tank/home", full, DeleteOpts::default())
            .await
            .unwrap();

        let store = runner.store.lock().await;
        assert!(store.backups.is_empty());
        assert_eq!(
            env.storage.deletions(),
            vec![
                format!("snaps/tank/home/{incr}"),
                format!("snaps/tank/home/{diff}"),
                format!("snaps/tank/home/{full}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_all_expired_with_zero_ttl() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        backup_chain(&runner).await;

        runner
            .delete_all_expired(DeleteOpts::default(), &short_expiry())
            .await
            .unwrap();

        let store = runner.store.lock().await;
        assert!(store.backups.is_empty());
        assert_eq!(env.storage.object_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_backup_fails() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;

        let err = runner
            .delete("tank/home", Ulid::new(), DeleteOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::BackupNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_dataset_mismatch_fails() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (full, _, _) = backup_chain(&runner).await;

        let err = runner
            .delete("tank/other", full, DeleteOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::DatasetMismatch { .. }));
    }
}
