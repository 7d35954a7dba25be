//! `cleanup` - sweep orphans and expired backups.

use std::sync::Arc;

use clap::{ArgAction, Args};
use tracing::info;

use crate::cli::commands::open_repository;
use crate::config::Config;
use crate::runner::DeleteOpts;
use crate::shutdown::Shutdown;

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Delete orphaned backups
    #[arg(long)]
    pub orphans: bool,

    /// Delete expired backups
    #[arg(long)]
    pub expired: bool,

    /// Dry run; pass `--dry-run false` to actually delete backups
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub dry_run: bool,

    /// Skip prerequisites verification
    #[arg(long)]
    pub skip_prerequisites_verification: bool,

    /// Skip local snapshot removal
    #[arg(long)]
    pub skip_local_snapshot_removal: bool,

    /// Skip remote snapshot removal
    #[arg(long)]
    pub skip_remote_snapshot_removal: bool,
}

pub async fn run(args: CleanupArgs, config: Arc<Config>, shutdown: Shutdown) -> anyhow::Result<()> {
    if !args.orphans && !args.expired {
        anyhow::bail!("no action specified: pass --orphans and/or --expired");
    }

    if args.dry_run {
        info!("Dry run enabled, no backups will be deleted. Pass --dry-run false to delete.");
    }

    let expiry = config.repository.expiry.clone();
    let runner = open_repository(config, shutdown).await?;

    let opts = DeleteOpts {
        skip_prerequisites_verification: args.skip_prerequisites_verification,
        skip_orphaning: false,
        skip_local_snapshot_removal: args.skip_local_snapshot_removal,
        skip_remote_snapshot_removal: args.skip_remote_snapshot_removal,
        dry_run: args.dry_run,
    };

    if args.orphans {
        info!("Deleting orphans");
        runner.delete_all_orphans(opts).await?;
    }

    if args.expired {
        info!(?expiry, "Deleting expired backups");
        runner.delete_all_expired(opts, &expiry).await?;
    }

    Ok(())
}
