//! Command-line surface.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::lock::GlobalLock;
use crate::shutdown::Shutdown;

pub const APP_NAME: &str = "zfsbackrest";

#[derive(Debug, Parser)]
#[command(
    name = APP_NAME,
    version,
    about = "Encrypted, incremental ZFS backups to an S3-compatible object store"
)]
pub struct Cli {
    /// Path to the config file
    #[arg(short = 'c', long, global = true, default_value = "/etc/zfsbackrest.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize a new backup repository
    Init(commands::init::InitArgs),

    /// Back up all managed datasets
    Backup(commands::backup::BackupArgs),

    /// Restore a backup to a dataset
    Restore(commands::restore::RestoreArgs),

    /// Clean up orphaned and expired backups
    Cleanup(commands::cleanup::CleanupArgs),

    /// Destroy a backup and all of its children
    ForceDestroy(commands::force_destroy::ForceDestroyArgs),

    /// Show details about the backup repository
    Detail(commands::detail::DetailArgs),
}

/// Per-command process prerequisites: root and the global single-instance
/// lock. The lock is released when the guard drops.
struct CommandGuard {
    _lock: Option<GlobalLock>,
}

impl CommandGuard {
    fn new(needs_root: bool, needs_lock: bool) -> anyhow::Result<Self> {
        if needs_root && unsafe { libc::geteuid() } != 0 {
            anyhow::bail!("{APP_NAME} must be run as root");
        }

        let lock = if needs_lock {
            Some(GlobalLock::acquire(APP_NAME).context("failed to acquire global lock")?)
        } else {
            None
        };

        Ok(Self { _lock: lock })
    }
}

pub async fn run(command: Command, config: Arc<Config>, shutdown: Shutdown) -> anyhow::Result<()> {
    match command {
        Command::Init(args) => {
            let _guard = CommandGuard::new(true, true)?;
            commands::init::run(args, config, shutdown).await
        }
        Command::Backup(args) => {
            let _guard = CommandGuard::new(true, true)?;
            commands::backup::run(args, config, shutdown).await
        }
        Command::Restore(args) => {
            let _guard = CommandGuard::new(true, true)?;
            commands::restore::run(args, config, shutdown).await
        }
        Command::Cleanup(args) => {
            let _guard = CommandGuard::new(true, true)?;
            commands::cleanup::run(args, config, shutdown).await
        }
        Command::ForceDestroy(args) => {
            let _guard = CommandGuard::new(true, true)?;
            commands::force_destroy::run(args, config, shutdown).await
        }
        Command::Detail(args) => {
            // Reading the repository needs no root, but reconciliation may
            // rewrite the manifest, so the lock still applies.
            let _guard = CommandGuard::new(false, true)?;
            commands::detail::run(args, config, shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_command() {
        let cli = Cli::parse_from(["zfsbackrest", "backup", "--type", "full"]);
        assert!(matches!(cli.command, Command::Backup(_)));
        assert_eq!(cli.config, PathBuf::from("/etc/zfsbackrest.toml"));
    }

    #[test]
    fn test_parse_restore_short_flags() {
        let cli = Cli::parse_from([
            "zfsbackrest",
            "restore",
            "-i",
            "/root/identity.txt",
            "-s",
            "tank/home",
            "-d",
            "tank/restore",
        ]);
        let Command::Restore(args) = cli.command else {
            panic!("expected restore command");
        };
        assert_eq!(args.src_dataset, "tank/home");
        assert_eq!(args.dst_dataset, "tank/restore");
        assert!(args.backup_id.is_none());
    }

    #[test]
    fn test_parse_cleanup_defaults() {
        let cli = Cli::parse_from(["zfsbackrest", "cleanup", "--orphans"]);
        let Command::Cleanup(args) = cli.command else {
            panic!("expected cleanup command");
        };
        assert!(args.orphans);
        assert!(!args.expired);
        assert!(args.dry_run);
    }

    #[test]
    fn test_parse_cleanup_disable_dry_run() {
        let cli = Cli::parse_from(["zfsbackrest", "cleanup", "--expired", "--dry-run", "false"]);
        let Command::Cleanup(args) = cli.command else {
            panic!("expected cleanup command");
        };
        assert!(args.expired);
        assert!(!args.dry_run);
    }
}
