//! Orchestrators driving the backup, delete and restore state machines.
//!
//! A `Runner` owns the in-memory store and the external capabilities. All
//! store-mutating transitions run sequentially; only snapshot uploads run in
//! parallel.

mod backup;
mod delete;
mod restore;

pub use delete::DeleteOpts;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::Config;
use crate::encryption::{AgeEncryption, Encryption, EncryptionError};
use crate::fsm::FsmError;
use crate::prompt::OperatorPrompt;
use crate::repository::{BackupError, EncryptionConfig, Store, StoreError};
use crate::shutdown::Shutdown;
use crate::storage::{ObjectStore, StorageError};
use crate::zfs::{SnapshotProvider, ZfsError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("dataset does not exist: {0}")]
    DatasetNotFound(String),

    #[error("backup not found: {0}")]
    BackupNotFound(Ulid),

    #[error("backup {id} does not belong to dataset {dataset}")]
    DatasetMismatch { id: Ulid, dataset: String },

    #[error("no restorable backup found for dataset {0}")]
    NoRestorableBackup(String),

    #[error("backup of dataset {dataset} failed")]
    BackupFailed {
        dataset: String,
        #[source]
        source: FsmError,
    },

    #[error("deletion of backup {id} failed")]
    DeleteFailed {
        id: Ulid,
        #[source]
        source: FsmError,
    },

    #[error("restore of backup {id} failed")]
    RestoreFailed {
        id: Ulid,
        #[source]
        source: FsmError,
    },

    #[error("aborted by operator")]
    Aborted,

    #[error("repository is already initialized")]
    AlreadyInitialized,

    #[error("failed to read operator input")]
    Prompt(#[source] std::io::Error),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Zfs(#[from] ZfsError),
}

#[derive(Clone)]
pub struct Runner {
    pub config: Arc<Config>,
    pub provider: Arc<dyn SnapshotProvider>,
    pub storage: Arc<dyn ObjectStore>,
    pub encryption: Arc<dyn Encryption>,
    pub store: Arc<Mutex<Store>>,
    pub shutdown: Shutdown,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

impl Runner {
    /// Load an existing repository, reconciling the managed dataset list with
    /// the configured globs before anything else runs.
    pub async fn from_existing_repository(
        config: Arc<Config>,
        provider: Arc<dyn SnapshotProvider>,
        storage: Arc<dyn ObjectStore>,
        prompt: &dyn OperatorPrompt,
        shutdown: Shutdown,
    ) -> Result<Self, RunnerError> {
        debug!("Creating runner from existing repository");

        let mut store = Store::load(storage.as_ref()).await?;

        reconcile_managed_datasets(
            &mut store,
            provider.as_ref(),
            storage.as_ref(),
            &config,
            prompt,
        )
        .await?;

        let encryption = Arc::new(AgeEncryption::new(&store.encryption.age)?);

        Ok(Self {
            config,
            provider,
            storage,
            encryption,
            store: Arc::new(Mutex::new(store)),
            shutdown,
        })
    }

    /// Initialize a new repository: expand the configured globs, write the
    /// initial manifest and return a runner over it.
    pub async fn with_new_repository(
        config: Arc<Config>,
        provider: Arc<dyn SnapshotProvider>,
        storage: Arc<dyn ObjectStore>,
        encryption_config: EncryptionConfig,
        shutdown: Shutdown,
    ) -> Result<Self, RunnerError> {
        debug!("Creating runner with new repository");

        match storage.load_manifest().await {
            Err(StorageError::ManifestNotFound) => {}
            Ok(_) => return Err(RunnerError::AlreadyInitialized),
            Err(err) => return Err(err.into()),
        }

        let managed_datasets = provider
            .list_datasets_with_globs(&config.repository.included_datasets)
            .await?;
        info!(datasets = ?managed_datasets, "Managed datasets");

        let store = Store::new(encryption_config, managed_datasets);
        store.save(storage.as_ref()).await?;

        let encryption = Arc::new(AgeEncryption::new(&store.encryption.age)?);

        Ok(Self {
            config,
            provider,
            storage,
            encryption,
            store: Arc::new(Mutex::new(store)),
            shutdown,
        })
    }

    /// Swap the encryption capability, e.g. for one that can decrypt.
    pub fn set_encryption(&mut self, encryption: Arc<dyn Encryption>) {
        self.encryption = encryption;
    }

    pub(crate) async fn save_store(&self) -> Result<(), StoreError> {
        let store = self.store.lock().await;
        store.save(self.storage.as_ref()).await
    }
}

/// Compare the stored managed dataset list against the freshly expanded
/// configured globs and, when they differ, let the operator apply or reject
/// the change. Rejecting the change offers to proceed with the current
/// manifest; rejecting that too aborts the command.
async fn reconcile_managed_datasets(
    store: &mut Store,
    provider: &dyn SnapshotProvider,
    storage: &dyn ObjectStore,
    config: &Config,
    prompt: &dyn OperatorPrompt,
) -> Result<(), RunnerError> {
    let expanded = provider
        .list_datasets_with_globs(&config.repository.included_datasets)
        .await?;

    let Some(diff) = store.diff_managed_datasets(&expanded) else {
        return Ok(());
    };

    println!("WARNING! Included datasets have changed.");
    println!("The following actions would be applied to the repository:");
    for removed in &diff.removed {
        println!("  - {removed}");
    }
    for added in &diff.added {
        println!("  + {added}");
    }
    println!(
        "\nPlan: {} to add, {} to remove.",
        diff.added.len(),
        diff.removed.len()
    );

    if prompt
        .confirm("Accept changes?", false)
        .map_err(RunnerError::Prompt)?
    {
        store.managed_datasets = expanded;
        store.save(storage).await?;
        info!("Managed datasets updated");
        return Ok(());
    }

    println!("Changes rejected.");
    if prompt
        .confirm("Continue with the current configuration?", true)
        .map_err(RunnerError::Prompt)?
    {
        return Ok(());
    }

    Err(RunnerError::Aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::testing::ScriptedPrompt;
    use crate::testutil::{test_config, TestEnv};

    #[tokio::test]
    async fn test_reconcile_no_diff_never_prompts() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;

        let mut store = runner.store.lock().await.clone();
        // ScriptedPrompt panics when asked; an empty script proves no prompt.
        let prompt = ScriptedPrompt::new(vec![]);
        reconcile_managed_datasets(
            &mut store,
            runner.provider.as_ref(),
            runner.storage.as_ref(),
            &runner.config,
            &prompt,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_applies_accepted_diff() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        env.provider.add_dataset("tank/srv");

        let config = test_config(&["tank/home".to_string(), "tank/srv".to_string()]);

        let mut store = runner.store.lock().await.clone();
        let prompt = ScriptedPrompt::new(vec![true]);
        reconcile_managed_datasets(
            &mut store,
            runner.provider.as_ref(),
            runner.storage.as_ref(),
            &config,
            &prompt,
        )
        .await
        .unwrap();

        assert_eq!(
            store.managed_datasets,
            vec!["tank/home".to_string(), "tank/srv".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reconcile_double_rejection_aborts() {
        let env = TestEnv::new(&["tank/home"]);
        let runner = env.runner_with_new_repository().await;
        env.provider.add_dataset("tank/srv");

        let config = test_config(&["tank/home".to_string(), "tank/srv".to_string()]);

        let mut store = runner.store.lock().await.clone();
        let prompt = ScriptedPrompt::new(vec![false, false]);
        let err = reconcile_managed_datasets(
            &mut store,
            runner.provider.as_ref(),
            runner.storage.as_ref(),
            &config,
            &prompt,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunnerError::Aborted));
        // The manifest is left unmodified.
        assert_eq!(store.managed_datasets, vec!["tank/home".to_string()]);
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let env = TestEnv::new(&["tank/home"]);
        let _runner = env.runner_with_new_repository().await;

        let err = Runner::with_new_repository(
            Arc::new(test_config(&["tank/home".to_string()])),
            env.provider.clone(),
            env.storage.clone(),
            env.encryption_config(),
            Shutdown::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyInitialized));
    }
}
