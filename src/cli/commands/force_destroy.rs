//! `force-destroy` - destroy a backup and all of its children.

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::warn;
use ulid::Ulid;

use crate::cli::commands::open_repository;
use crate::config::Config;
use crate::runner::DeleteOpts;
use crate::shutdown::Shutdown;

#[derive(Debug, Args)]
pub struct ForceDestroyArgs {
    /// Backup ID to destroy, along with all of its children
    #[arg(short = 'i', long)]
    pub snapshot_id: String,

    /// Dataset the backup belongs to
    #[arg(short = 'd', long)]
    pub dataset_name: String,

    /// Confirm the destruction
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Skip prerequisites verification
    #[arg(short = 's', long)]
    pub skip_prerequisites_verification: bool,

    /// Skip orphaning; only valid when destroying an orphan entry
    #[arg(short = 'o', long)]
    pub skip_orphaning: bool,

    /// Skip removing the local snapshot
    #[arg(short = 'l', long)]
    pub skip_local_snapshot_removal: bool,

    /// Skip removing the remote snapshot object
    #[arg(short = 'r', long)]
    pub skip_remote_snapshot_removal: bool,
}

pub async fn run(
    args: ForceDestroyArgs,
    config: Arc<Config>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let id = Ulid::from_string(&args.snapshot_id).context("failed to parse backup ID")?;

    let runner = open_repository(config, shutdown).await?;

    let children: Vec<Ulid> = {
        let store = runner.store.lock().await;
        let backup = store
            .backups
            .get(&id)
            .with_context(|| format!("backup not found: {id}"))?;

        if backup.dataset != args.dataset_name {
            anyhow::bail!(
                "backup dataset does not match: expected {}, got {}",
                backup.dataset,
                args.dataset_name
            );
        }

        store.backups.all_children(id).iter().map(|b| b.id).collect()
    };

    warn!(backup = %id, "Backup will be destroyed");
    for child in &children {
        warn!(backup = %child, "Dependent backup will be destroyed");
    }

    if !args.yes {
        anyhow::bail!("force-destroy requires --yes");
    }

    runner
        .delete_recursive(
            &args.dataset_name,
            id,
            DeleteOpts {
                skip_prerequisites_verification: args.skip_prerequisites_verification,
                skip_orphaning: args.skip_orphaning,
                skip_local_snapshot_removal: args.skip_local_snapshot_removal,
                skip_remote_snapshot_removal: args.skip_remote_snapshot_removal,
                dry_run: false,
            },
        )
        .await?;

    Ok(())
}
