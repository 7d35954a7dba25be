//! Per-dataset backup state machine and the concurrent upload driver.
//!
//! For a batch of datasets, the manifest-committing steps run sequentially so
//! there is never more than one writer of the manifest in flight; only the
//! `upload_snapshot` step runs in parallel, bounded per backup kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};
use ulid::Ulid;

use crate::fsm::{Fsm, FsmError, RetryPolicy, Transition, TransitionError, TransitionFuture};
use crate::repository::{Backup, BackupKind, OrphanReason};
use crate::runner::{Runner, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupState {
    Initial,
    GotParent,
    CreatedSnapshot,
    CreatedManifest,
    AddedOrphan,
    UploadedSnapshot,
    UpdatedStore,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupAction {
    GetParent,
    CreateSnapshot,
    CreateManifest,
    AddOrphan,
    UploadSnapshot,
    UpdateStore,
    Complete,
}

pub struct BackupFsmData {
    pub dataset: String,
    pub backup_id: Ulid,
    pub kind: BackupKind,
    pub parent: Option<Backup>,
    pub manifest: Option<Backup>,
    pub snapshot_size: i64,
}

type BackupFsm = Fsm<BackupState, BackupAction, BackupFsmData>;

fn backup_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        wait_increment: Duration::from_secs(1),
        max_wait: Duration::from_secs(10),
    }
}

impl Runner {
    /// Back up every managed dataset with the given kind.
    pub async fn backup_all_managed(&self, kind: BackupKind) -> Result<(), RunnerError> {
        let datasets = self.store.lock().await.managed_datasets.clone();
        info!(?datasets, %kind, "Backing up managed datasets");
        self.backup_concurrent(kind, &datasets).await
    }

    /// Run the backup state machines for a batch of datasets: steps through
    /// `add_orphan` sequentially for all of them, then uploads concurrently,
    /// then commits the results sequentially.
    pub async fn backup_concurrent(
        &self,
        kind: BackupKind,
        datasets: &[String],
    ) -> Result<(), RunnerError> {
        debug!(?datasets, "Creating backup FSMs");
        let mut fsms: Vec<(String, Arc<BackupFsm>)> = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            let fsm = self.create_backup_fsm(kind, dataset).await?;
            fsms.push((dataset.clone(), Arc::new(fsm)));
        }

        // All FSMs reach a committed-orphan state before any bytes move.
        for (dataset, fsm) in &fsms {
            fsm.run_sequence([
                BackupAction::GetParent,
                BackupAction::CreateSnapshot,
                BackupAction::CreateManifest,
                BackupAction::AddOrphan,
            ])
            .await
            .map_err(|source| RunnerError::BackupFailed {
                dataset: dataset.clone(),
                source,
            })?;
        }

        let max_concurrency = self.config.upload_concurrency.for_kind(kind);
        info!(max_concurrency, "Uploading snapshots concurrently");

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut uploads: JoinSet<(String, Result<(), FsmError>)> = JoinSet::new();
        for (dataset, fsm) in &fsms {
            let dataset = dataset.clone();
            let fsm = fsm.clone();
            let semaphore = semaphore.clone();
            uploads.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (dataset, Err(FsmError::Cancelled)),
                };
                let result = fsm.run(BackupAction::UploadSnapshot).await;
                (dataset, result)
            });
        }

        let mut first_failure: Option<RunnerError> = None;
        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((dataset, Err(source))) => {
                    if first_failure.is_none() {
                        first_failure = Some(RunnerError::BackupFailed { dataset, source });
                    }
                }
                Err(join_err) => {
                    if first_failure.is_none() {
                        first_failure = Some(RunnerError::BackupFailed {
                            dataset: String::new(),
                            source: FsmError::Unrecoverable(join_err.into()),
                        });
                    }
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        // Commit sequentially, in configuration order.
        for (dataset, fsm) in &fsms {
            fsm.run_sequence([BackupAction::UpdateStore, BackupAction::Complete])
                .await
                .map_err(|source| RunnerError::BackupFailed {
                    dataset: dataset.clone(),
                    source,
                })?;
        }

        info!("Concurrent backup completed");
        Ok(())
    }

    pub(crate) async fn create_backup_fsm(
        &self,
        kind: BackupKind,
        dataset: &str,
    ) -> Result<BackupFsm, RunnerError> {
        let backup_id = Ulid::new();
        debug!(%kind, dataset, backup = %backup_id, "Creating backup FSM");

        // Fast fail when the source dataset does not exist.
        if !self.provider.dataset_exists(dataset).await? {
            return Err(RunnerError::DatasetNotFound(dataset.to_string()));
        }

        let data = BackupFsmData {
            dataset: dataset.to_string(),
            backup_id,
            kind,
            parent: None,
            manifest: None,
            snapshot_size: 0,
        };

        let mut transitions = HashMap::new();

        transitions.insert(
            BackupAction::GetParent,
            Transition::new(BackupState::Initial, BackupState::GotParent, {
                let runner = self.clone();
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        debug!(dataset = %data.dataset, kind = %data.kind, "Getting parent backup");

                        let parent = {
                            let store = runner.store.lock().await;
                            store
                                .backups
                                .parent_for(&data.dataset, data.kind)
                                .map_err(TransitionError::unrecoverable)?
                                .cloned()
                        };

                        let Some(parent) = parent else {
                            debug!(dataset = %data.dataset, "No parent backup needed");
                            data.parent = None;
                            return Ok(());
                        };

                        // The incremental send needs the parent snapshot
                        // locally; its absence cannot be retried away.
                        let exists = runner
                            .provider
                            .snapshot_exists(&data.dataset, parent.id)
                            .await
                            .map_err(TransitionError::retryable)?;
                        if !exists {
                            return Err(TransitionError::unrecoverable_msg(format!(
                                "snapshot for parent backup {} does not exist",
                                parent.id
                            )));
                        }

                        data.parent = Some(parent);
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            BackupAction::CreateSnapshot,
            Transition::new(BackupState::GotParent, BackupState::CreatedSnapshot, {
                let runner = self.clone();
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        let exists = runner
                            .provider
                            .snapshot_exists(&data.dataset, data.backup_id)
                            .await
                            .map_err(TransitionError::retryable)?;
                        if exists {
                            debug!(
                                dataset = %data.dataset,
                                backup = %data.backup_id,
                                "Snapshot already exists, skipping creation"
                            );
                            return Ok(());
                        }

                        runner
                            .provider
                            .create_snapshot(&data.dataset, data.backup_id)
                            .await
                            .map_err(TransitionError::retryable)?;

                        // Chain parents must survive until their children are
                        // deleted; incrementals are leaves and stay unheld.
                        if data.kind != BackupKind::Incr {
                            runner
                                .provider
                                .hold_snapshot(&data.dataset, data.backup_id)
                                .await
                                .map_err(TransitionError::retryable)?;
                        }

                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            BackupAction::CreateManifest,
            Transition::new(BackupState::CreatedSnapshot, BackupState::CreatedManifest, {
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        debug!(dataset = %data.dataset, "Creating backup manifest");

                        match (data.kind, data.parent.as_ref()) {
                            (BackupKind::Full, Some(_)) => {
                                return Err(TransitionError::unrecoverable_msg(
                                    "full backup cannot have a parent backup",
                                ));
                            }
                            (BackupKind::Diff, None) => {
                                return Err(TransitionError::unrecoverable_msg(
                                    "diff backup must have a parent backup",
                                ));
                            }
                            (BackupKind::Incr, None) => {
                                return Err(TransitionError::unrecoverable_msg(
                                    "incremental backup must have a parent backup",
                                ));
                            }
                            _ => {}
                        }

                        let manifest = Backup {
                            id: data.backup_id,
                            kind: data.kind,
                            created_at: Utc::now(),
                            depends_on: data.parent.as_ref().map(|p| p.id),
                            dataset: data.dataset.clone(),
                            size: 0,
                        };

                        info!(backup = %manifest.id, dataset = %manifest.dataset, "Created backup manifest");
                        data.manifest = Some(manifest);
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            BackupAction::AddOrphan,
            Transition::new(BackupState::CreatedManifest, BackupState::AddedOrphan, {
                let runner = self.clone();
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        let manifest = required_manifest(data)?;
                        debug!(backup = %manifest.id, "Adding orphan");

                        {
                            let mut store = runner.store.lock().await;
                            store
                                .add_orphan(manifest, OrphanReason::Uncommitted)
                                .map_err(TransitionError::unrecoverable)?;
                        }

                        runner
                            .save_store()
                            .await
                            .map_err(TransitionError::retryable)?;
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            BackupAction::UploadSnapshot,
            Transition::new(BackupState::AddedOrphan, BackupState::UploadedSnapshot, {
                let runner = self.clone();
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        let manifest = required_manifest(data)?;
                        debug!(backup = %manifest.id, dataset = %data.dataset, "Uploading snapshot");

                        let mut writer = runner
                            .storage
                            .open_snapshot_write_stream(
                                &data.dataset,
                                &manifest.id.to_string(),
                                -1,
                                runner.encryption.as_ref(),
                            )
                            .await
                            .map_err(TransitionError::retryable)?;

                        let parent_id = data.parent.as_ref().map(|p| p.id);
                        let size = runner
                            .provider
                            .send(&data.dataset, manifest.id, parent_id, &mut *writer)
                            .await
                            .map_err(TransitionError::retryable)?;

                        // Flushes the AEAD footer and waits for the transport
                        // to acknowledge the object.
                        writer
                            .shutdown()
                            .await
                            .map_err(TransitionError::retryable)?;

                        data.snapshot_size = size;
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            BackupAction::UpdateStore,
            Transition::new(BackupState::UploadedSnapshot, BackupState::UpdatedStore, {
                let runner = self.clone();
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    let runner = runner.clone();
                    Box::pin(async move {
                        let mut manifest = required_manifest(data)?;
                        debug!(backup = %manifest.id, "Updating store");

                        manifest.size = data.snapshot_size;
                        data.manifest = Some(manifest.clone());

                        {
                            let mut store = runner.store.lock().await;
                            store
                                .remove_orphan(manifest.id)
                                .map_err(TransitionError::unrecoverable)?;
                            store
                                .add_backup(manifest)
                                .map_err(TransitionError::unrecoverable)?;
                        }

                        runner
                            .save_store()
                            .await
                            .map_err(TransitionError::retryable)?;
                        Ok(())
                    })
                }
            }),
        );

        transitions.insert(
            BackupAction::Complete,
            Transition::new(BackupState::UpdatedStore, BackupState::Completed, {
                move |data: &mut BackupFsmData| -> TransitionFuture<'_> {
                    Box::pin(async move {
                        info!(
                            dataset = %data.dataset,
                            backup = %data.backup_id,
                            size = data.snapshot_size,
                            "Backup completed"
                        );
                        Ok(())
                    })
                }
            }),
        );

        Ok(Fsm::new(
            "backup",
            BackupState::Initial,
            data,
            transitions,
            backup_retry_policy(),
            self.shutdown.clone(),
        ))
    }
}

fn required_manifest(data: &BackupFsmData) -> Result<Backup, TransitionError> {
    data.manifest
        .clone()
        .ok_or_else(|| TransitionError::unrecoverable_msg("backup manifest not created yet"))
}
