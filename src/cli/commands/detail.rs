//! `detail` - show the repository contents.

use std::sync::Arc;

use clap::Args;

use crate::cli::commands::open_repository;
use crate::config::Config;
use crate::repository::Backup;
use crate::shutdown::Shutdown;

#[derive(Debug, Args)]
pub struct DetailArgs {
    /// Dump the manifest as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: DetailArgs, config: Arc<Config>, shutdown: Shutdown) -> anyhow::Result<()> {
    let expiry = config.repository.expiry.clone();
    let runner = open_repository(config, shutdown).await?;
    let store = runner.store.lock().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&*store)?);
        return Ok(());
    }

    println!("Repository created at {}", store.created_at.to_rfc3339());
    println!();

    for dataset in &store.managed_datasets {
        println!("{dataset}:");

        let mut backups: Vec<&Backup> = store
            .backups
            .iter()
            .filter(|b| b.dataset == *dataset)
            .collect();
        backups.sort_by_key(|b| b.created_at);

        if backups.is_empty() {
            println!("  (no backups)");
        }

        for backup in backups {
            let expires = match store.backups.time_till_expiry(backup.id, &expiry) {
                Ok(left) if left > chrono::TimeDelta::zero() => match left.to_std() {
                    Ok(left) => {
                        format!("expires in {}", humantime::format_duration(trim_subsec(left)))
                    }
                    Err(_) => "expires never".to_string(),
                },
                Ok(_) => "expired".to_string(),
                Err(err) => format!("invalid: {err}"),
            };

            let depends_on = backup
                .depends_on
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());

            println!(
                "  {} {:4} {} size={} depends_on={} ({})",
                backup.id,
                backup.kind,
                backup.created_at.to_rfc3339(),
                backup.size,
                depends_on,
                expires
            );
        }
        println!();
    }

    if !store.orphans.is_empty() {
        println!("Orphans:");
        for orphan in store.orphans.values() {
            println!(
                "  {} {:4} {} reason={:?}",
                orphan.backup.id, orphan.backup.kind, orphan.backup.dataset, orphan.reason
            );
        }
    }

    Ok(())
}

/// Drop sub-second precision for display.
fn trim_subsec(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(duration.as_secs())
}
