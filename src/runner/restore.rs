//! Per-backup restore state machine with parent-first recursion.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};
use ulid::Ulid;

use crate::fsm::{Fsm, RetryPolicy, Transition, TransitionError, TransitionFuture};
use crate::repository::Backup;
use crate::runner::{Runner, RunnerError};
use crate::utils::progress::LoggedReader;
use crate::zfs::RecvOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreState {
    Initial,
    ParentSnapshotExists,
    Restored,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreAction {
    CheckParentSnapshot,
    Restore,
    Complete,
}

pub struct RestoreFsmData {
    pub dst_dataset: String,
    pub backup: Backup,
}

type RestoreFsm = Fsm<RestoreState, RestoreAction, RestoreFsmData>;

fn restore_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 5,
        wait_increment: Duration::from_secs(2),
        max_wait: Duration::from_secs(10),
    }
}

impl Runner {
    /// The newest backup of any kind for the dataset; the natural restore
    /// target.
    pub async fn latest_restorable(&self, dataset: &str) -> Result<Ulid, RunnerError> {
        let store = self.store.lock().await;
        store
            .backups
            .iter()
            .filter(|b| b.dataset == dataset)
            .max_by_key(|b| b.created_at)
            .map(|b| b.id)
            .ok_or_else(|| RunnerError::NoRestorableBackup(dataset.to_string()))
    }

    /// Restore a backup and all of its dependencies, root full first.
    pub fn restore_recursive<'a>(
        &'a self,
        dst_dataset: &'a str,
        id: Ulid,
    ) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + 'a>> {
        Box::pin(async move {
            debug!(dst_dataset, backup = %id, "Restoring recursively");

            let backup = {
                let store = self.store.lock().await;
                store
                    .backups
                    .get(&id)
                    .cloned()
                    .ok_or(RunnerError::BackupNotFound(id))?
            };

            if let Some(parent) = backup.depends_on {
                debug!(dst_dataset, backup = %id, parent = %parent, "Restoring parent first");
                self.restore_recursive(dst_dataset, parent).await?;
            }

            self.restore(dst_dataset, id).await
        })
    }

    /// Restore a single backup by driving its state machine.
    pub async fn restore(&self, dst_dataset: &str, id: Ulid) -> Result<(), RunnerError> {
        info!(dst_dataset, backup = %id, "Restoring");

        let fsm = self.create_restore_fsm(dst_dataset, id).await?;
        fsm.run_sequence([
            RestoreAction::CheckParentSnapshot,
            RestoreAction::Restore,
            RestoreAction::Complete,
        ])
        .await
        .map_err(|source| RunnerError::RestoreFailed { id, source })
    }

    async fn create_restore_fsm(
        &self,
        dst_dataset: &str,
        id: Ulid,
    ) -> Result<RestoreFsm, RunnerError> {
        debug!(dst_dataset, backup = %id, "Creating restore FSM");

        let backup = {
            let store = self.store.lock().await;
            store
                .backups
                .get(&id)
                .cloned()
                .ok_or(RunnerError::BackupNotFound(id))?
        };

        let data = RestoreFsmData {
            dst_dataset: dst_dataset.to_string(),
            backup,
        };

        let mut transitions = HashMap::new();

        transitions.insert(
            RestoreAction::CheckParentSnapshot,
            Transition::new(RestoreState::Initial, RestoreState::ParentSnapshotExists, {
                let runner = self.clone();
                move |data: &mut RestoreFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        let Some(parent) = data.backup.depends_on else {
                            debug!(backup = %data.backup.id, "No parent snapshot needed");
                            return Ok(());
                        };

                        let exists = runner
                            .provider
                            .snapshot_exists(&data.dst_dataset, parent)
                            .await
                            .map_err(TransitionError::retryable)?;

                        // An incremental stream only applies on top of its
                        // parent snapshot; without it the restore can never
                        // succeed.
                        if !exists {
                            return Err(TransitionError::unrecoverable_msg(format!(
                                "parent snapshot {parent} does not exist on {}",
                                data.dst_dataset
                            )));
                        }

                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            RestoreAction::Restore,
            Transition::new(RestoreState::ParentSnapshotExists, RestoreState::Restored, {
                let runner = self.clone();
                move |data: &mut RestoreFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(
                            backup = %data.backup.id,
                            source = %data.backup.dataset,
                            destination = %data.dst_dataset,
                            "Restoring snapshot"
                        );

                        let reader = runner
                            .storage
                            .open_snapshot_read_stream(
                                &data.backup.dataset,
                                &data.backup.id.to_string(),
                                runner.encryption.as_ref(),
                            )
                            .await
                            .map_err(TransitionError::retryable)?;

                        let mut logged = LoggedReader::new(
                            "restore",
                            reader,
                            Duration::from_secs(1),
                            data.backup.size,
                        );

                        runner
                            .provider
                            .recv(
                                &data.dst_dataset,
                                data.backup.id,
                                &mut logged,
                                RecvOptions {
                                    keep_unmounted: true,
                                },
                            )
                            .await
                            .map_err(TransitionError::retryable)?;

                        debug!(backup = %data.backup.id, "Snapshot restored");
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            RestoreAction::Complete,
            Transition::new(RestoreState::Restored, RestoreState::Completed, {
                move |data: &mut RestoreFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        info!(
                            destination = %data.dst_dataset,
                            backup = %data.backup.id,
                            "Restore completed"
                        );
                        Ok(())
                    })
                }
            }),
        );

        Ok(Fsm::new(
            "restore",
            RestoreState::Initial,
            data,
            transitions,
            restore_retry_policy(),
            self.shutdown.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::FsmError;
    use crate::repository::BackupKind;
    use crate::testutil::{snapshot_payload, TestEnv};

    async fn backup_chain(runner: &Runner) -> (Ulid, Ulid, Ulid) {
        runner.backup_all_managed(BackupKind::Full).await.unwrap();
        runner.backup_all_managed(BackupKind::Diff).await.unwrap();
        runner.backup_all_managed(BackupKind::Incr).await.unwrap();

        let store = runner.store.lock().await;
        let full = store.backups.latest_full("tank/home").unwrap().id;
        let diff = store.backups.latest_diff("tank/home").unwrap().id;
        let incr = store.backups.latest_incr("tank/home").unwrap().id;
        (full, diff, incr)
    }

    #[tokio::test]
    async fn test_restore_chain_in_root_first_order() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (full, diff, incr) = backup_chain(&runner).await;

        runner
            .restore_recursive("tank/restore", incr)
            .await
            .unwrap();

        let calls = env.provider.recv_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![full, diff, incr]
        );
        assert!(calls.iter().all(|c| c.dataset == "tank/restore"));

        // Each recv consumed the decrypted stream of the matching object.
        assert_eq!(calls[0].content, snapshot_payload("tank/home", full, None));
        assert_eq!(
            calls[1].content,
            snapshot_payload("tank/home", diff, Some(full))
        );
        assert_eq!(
            calls[2].content,
            snapshot_payload("tank/home", incr, Some(diff))
        );
    }

    #[tokio::test]
    async fn test_restore_single_full() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        runner.backup_all_managed(BackupKind::Full).await.unwrap();
        let full = runner.latest_restorable("tank/home").await.unwrap();

        runner.restore("tank/restore", full).await.unwrap();

        let calls = env.provider.recv_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, full);
    }

    #[tokio::test]
    async fn test_restore_incr_without_parent_snapshot_is_unrecoverable() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (_, _, incr) = backup_chain(&runner).await;

        // Restoring the incr directly: the destination has no parent
        // snapshot yet.
        let err = runner.restore("tank/restore", incr).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::RestoreFailed {
                source: FsmError::Unrecoverable(_),
                ..
            }
        ));
        assert!(env.provider.recv_calls().is_empty());
    }

    #[tokio::test]
    async fn test_latest_restorable_picks_newest_any_kind() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        let (_, _, incr) = backup_chain(&runner).await;

        assert_eq!(runner.latest_restorable("tank/home").await.unwrap(), incr);
    }

    #[tokio::test]
    async fn test_latest_restorable_fails_on_empty() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;

        let err = runner.latest_restorable("tank/home").await.unwrap_err();
        assert!(matches!(err, RunnerError::NoRestorableBackup(_)));
    }

    #[tokio::test]
    async fn test_restore_unknown_backup_fails() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;

        let err = runner
            .restore_recursive("tank/restore", Ulid::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::BackupNotFound(_)));
    }
}
