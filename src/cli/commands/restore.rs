//! `restore` - restore a backup chain into a destination dataset.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::info;
use ulid::Ulid;

use crate::cli::commands::open_repository;
use crate::config::Config;
use crate::encryption::AgeEncryption;
use crate::shutdown::Shutdown;

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Path to the age identity file
    #[arg(short = 'i', long)]
    pub age_identity_file: PathBuf,

    /// Source dataset the backup was taken from; does not need to exist
    /// locally
    #[arg(short = 's', long)]
    pub src_dataset: String,

    /// Destination dataset to restore into
    #[arg(short = 'd', long)]
    pub dst_dataset: String,

    /// Backup ID to restore; defaults to the latest backup
    #[arg(short = 'b', long)]
    pub backup_id: Option<String>,
}

pub async fn run(args: RestoreArgs, config: Arc<Config>, shutdown: Shutdown) -> anyhow::Result<()> {
    let identity = tokio::fs::read_to_string(&args.age_identity_file)
        .await
        .with_context(|| {
            format!(
                "failed to read age identity file {}",
                args.age_identity_file.display()
            )
        })?;

    let mut runner = open_repository(config, shutdown).await?;

    // Swap in an encryption instance that can decrypt.
    let age_config = runner.store.lock().await.encryption.age.clone();
    let encryption = AgeEncryption::with_identity(&identity, &age_config)
        .context("failed to create decryption-capable encryption instance")?;
    runner.set_encryption(Arc::new(encryption));

    let backup_id = match &args.backup_id {
        Some(raw) => Ulid::from_string(raw).context("failed to parse backup ID")?,
        None => runner.latest_restorable(&args.src_dataset).await?,
    };

    info!(
        backup = %backup_id,
        source = %args.src_dataset,
        destination = %args.dst_dataset,
        "Restoring backup"
    );

    runner
        .restore_recursive(&args.dst_dataset, backup_id)
        .await?;

    info!(backup = %backup_id, "Backup restored");
    Ok(())
}
