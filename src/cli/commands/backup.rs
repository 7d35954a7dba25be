//! `backup` - back up all managed datasets with the given kind.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::cli::commands::open_repository;
use crate::config::Config;
use crate::repository::BackupKind;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackupKindArg {
    Full,
    Diff,
    Incr,
}

impl From<BackupKindArg> for BackupKind {
    fn from(kind: BackupKindArg) -> Self {
        match kind {
            BackupKindArg::Full => BackupKind::Full,
            BackupKindArg::Diff => BackupKind::Diff,
            BackupKindArg::Incr => BackupKind::Incr,
        }
    }
}

#[derive(Debug, Args)]
pub struct BackupArgs {
    /// Backup kind
    #[arg(long = "type", value_enum)]
    pub kind: BackupKindArg,
}

pub async fn run(args: BackupArgs, config: Arc<Config>, shutdown: Shutdown) -> anyhow::Result<()> {
    let runner = open_repository(config, shutdown).await?;
    runner.backup_all_managed(args.kind.into()).await?;
    Ok(())
}
