pub mod backup;
pub mod cleanup;
pub mod detail;
pub mod force_destroy;
pub mod init;
pub mod restore;

use std::sync::Arc;

use crate::config::Config;
use crate::prompt::StdinPrompt;
use crate::runner::Runner;
use crate::shutdown::Shutdown;
use crate::storage::S3ObjectStore;
use crate::zfs::Zfs;

/// Build a runner over the existing repository, with the real capabilities.
pub(crate) async fn open_repository(
    config: Arc<Config>,
    shutdown: Shutdown,
) -> anyhow::Result<Runner> {
    let storage = Arc::new(S3ObjectStore::new(&config.repository.s3));
    let runner = Runner::from_existing_repository(
        config,
        Arc::new(Zfs::new()),
        storage,
        &StdinPrompt,
        shutdown,
    )
    .await?;
    Ok(runner)
}
