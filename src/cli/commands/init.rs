//! `init` - create a new repository manifest.

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::info;

use crate::config::Config;
use crate::encryption::validate_recipient;
use crate::repository::{AgeConfig, EncryptionConfig};
use crate::runner::Runner;
use crate::shutdown::Shutdown;
use crate::storage::S3ObjectStore;
use crate::zfs::Zfs;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// The public key to use for age encryption
    #[arg(long)]
    pub age_recipient_public_key: String,
}

pub async fn run(args: InitArgs, config: Arc<Config>, shutdown: Shutdown) -> anyhow::Result<()> {
    info!("Initializing ZFS backup repository");

    validate_recipient(&args.age_recipient_public_key)
        .context("invalid age recipient public key")?;

    let storage = Arc::new(S3ObjectStore::new(&config.repository.s3));
    Runner::with_new_repository(
        config,
        Arc::new(Zfs::new()),
        storage,
        EncryptionConfig {
            age: AgeConfig {
                recipient_public_key: args.age_recipient_public_key,
            },
        },
        shutdown,
    )
    .await
    .context("failed to initialize repository")?;

    info!("Repository initialized successfully");
    Ok(())
}
