//! Snapshot provider abstraction and the ZFS CLI implementation.
//!
//! Snapshots are named `<dataset>@zfsbackrest-<backup_id>`; the provider owns
//! the naming convention, callers pass backup IDs unchanged.

mod cmd;

pub use cmd::ZfsError;

use std::collections::BTreeSet;
use std::process::Stdio;

use async_trait::async_trait;
use globset::Glob;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::utils::progress::LoggedWriter;
use cmd::{run_zfs, spawn_zfs_streaming};

/// Tag used for `zfs hold`/`zfs release` on chain-parent snapshots.
const HOLD_TAG: &str = "zfsbackrest";

#[derive(Debug, Clone, Copy, Default)]
pub struct RecvOptions {
    /// Pass `-u` so the received dataset is not mounted.
    pub keep_unmounted: bool,
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, ZfsError>;

    async fn list_datasets(&self) -> Result<Vec<String>, ZfsError>;

    /// Union of all datasets matching any glob; deduped and sorted.
    async fn list_datasets_with_globs(&self, globs: &[String]) -> Result<Vec<String>, ZfsError>;

    async fn snapshot_exists(&self, dataset: &str, id: Ulid) -> Result<bool, ZfsError>;

    async fn create_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError>;

    async fn delete_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError>;

    async fn hold_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError>;

    async fn release_snapshot(
        &self,
        dataset: &str,
        id: Ulid,
        ignore_missing: bool,
    ) -> Result<(), ZfsError>;

    /// Stream the snapshot into `dst`; incremental iff `parent` is provided.
    /// Returns the number of bytes streamed.
    async fn send(
        &self,
        dataset: &str,
        id: Ulid,
        parent: Option<Ulid>,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64, ZfsError>;

    /// Receive a snapshot stream into `dataset`.
    async fn recv(
        &self,
        dataset: &str,
        id: Ulid,
        src: &mut (dyn AsyncRead + Send + Unpin),
        opts: RecvOptions,
    ) -> Result<(), ZfsError>;
}

pub fn snapshot_name(dataset: &str, id: Ulid) -> String {
    format!("{dataset}@{HOLD_TAG}-{id}")
}

/// Expand glob patterns against a dataset list; deduped and sorted.
pub(crate) fn match_globs(datasets: &[String], globs: &[String]) -> Result<Vec<String>, ZfsError> {
    let mut matched = BTreeSet::new();

    for pattern in globs {
        let matcher = Glob::new(pattern)
            .map_err(|source| ZfsError::InvalidGlob {
                pattern: pattern.clone(),
                source,
            })?
            .compile_matcher();

        for dataset in datasets {
            if matcher.is_match(dataset) {
                matched.insert(dataset.clone());
            }
        }
    }

    Ok(matched.into_iter().collect())
}

/// Drives the system `zfs` binary.
#[derive(Debug, Default)]
pub struct Zfs;

impl Zfs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SnapshotProvider for Zfs {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, ZfsError> {
        match run_zfs(&["list", "-H", "-t", "filesystem", "-o", "name", dataset]).await {
            Ok(_) => Ok(true),
            // zfs list exits 1 when the dataset does not exist.
            Err(err) if err.is_exit_code(1) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_datasets(&self) -> Result<Vec<String>, ZfsError> {
        let stdout = run_zfs(&["list", "-H", "-t", "filesystem", "-o", "name"]).await?;

        let datasets: Vec<String> = String::from_utf8_lossy(&stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        debug!(count = datasets.len(), "Listed ZFS datasets");
        Ok(datasets)
    }

    async fn list_datasets_with_globs(&self, globs: &[String]) -> Result<Vec<String>, ZfsError> {
        let datasets = self.list_datasets().await?;
        let matched = match_globs(&datasets, globs)?;
        debug!(?globs, count = matched.len(), "Matched datasets");
        Ok(matched)
    }

    async fn snapshot_exists(&self, dataset: &str, id: Ulid) -> Result<bool, ZfsError> {
        let snap = snapshot_name(dataset, id);
        match run_zfs(&["list", "-H", "-t", "snapshot", "-o", "name", &snap]).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_exit_code(1) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);
        run_zfs(&["snapshot", &snap]).await?;
        debug!(snapshot = %snap, "Created ZFS snapshot");
        Ok(())
    }

    async fn delete_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);
        run_zfs(&["destroy", &snap]).await?;
        debug!(snapshot = %snap, "Destroyed ZFS snapshot");
        Ok(())
    }

    async fn hold_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);
        run_zfs(&["hold", HOLD_TAG, &snap]).await?;
        debug!(snapshot = %snap, "Held ZFS snapshot");
        Ok(())
    }

    async fn release_snapshot(
        &self,
        dataset: &str,
        id: Ulid,
        ignore_missing: bool,
    ) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);
        match run_zfs(&["release", HOLD_TAG, &snap]).await {
            Ok(_) => {
                debug!(snapshot = %snap, "Released ZFS snapshot hold");
                Ok(())
            }
            Err(err) if ignore_missing => {
                debug!(snapshot = %snap, error = %err, "Ignoring failed hold release");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn send(
        &self,
        dataset: &str,
        id: Ulid,
        parent: Option<Ulid>,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64, ZfsError> {
        let snap = snapshot_name(dataset, id);
        let parent_snap = parent.map(|p| snapshot_name(dataset, p));

        let mut args = vec!["send", "-LPpc", snap.as_str()];
        if let Some(ref parent_snap) = parent_snap {
            args.push("-i");
            args.push(parent_snap);
        }

        let mut child = spawn_zfs_streaming(&args, Stdio::null())?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;
        let mut stdout = child.stdout.take().ok_or_else(missing_pipe)?;

        // `zfs send -P` announces the stream size on stderr before any data;
        // keep draining stderr afterwards so the child never blocks on it.
        let (size_tx, size_rx) = oneshot::channel();
        tokio::spawn(scan_send_stderr(stderr, size_tx));

        let announced = size_rx.await.map_err(|_| ZfsError::MissingSendSize)??;
        debug!(snapshot = %snap, announced, "Streaming snapshot");

        let mut logged = LoggedWriter::new(
            snap.clone(),
            dst,
            std::time::Duration::from_secs(5),
            announced,
        );
        let streamed = tokio::io::copy(&mut stdout, &mut logged).await? as i64;

        let status = child.wait().await?;
        if !status.success() {
            return Err(ZfsError::CommandFailed {
                args: args.iter().map(|s| s.to_string()).collect(),
                code: status.code(),
                stderr: String::new(),
            });
        }

        // The announced size excludes stream headers and checksums, so more
        // bytes than announced is normal; fewer means truncation.
        if streamed < announced {
            error!(snapshot = %snap, announced, streamed, "Snapshot stream truncated");
            return Err(ZfsError::SendTruncated {
                announced,
                streamed,
            });
        }

        Ok(streamed)
    }

    async fn recv(
        &self,
        dataset: &str,
        id: Ulid,
        src: &mut (dyn AsyncRead + Send + Unpin),
        opts: RecvOptions,
    ) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);

        let mut args = vec!["recv"];
        if opts.keep_unmounted {
            args.push("-u");
        }
        args.push(&snap);

        let mut child = spawn_zfs_streaming(&args, Stdio::piped())?;
        let mut stdin = child.stdin.take().ok_or_else(missing_pipe)?;

        let copied = tokio::io::copy(src, &mut stdin).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ZfsError::CommandFailed {
                args: args.iter().map(|s| s.to_string()).collect(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(snapshot = %snap, copied, "Received ZFS snapshot");
        Ok(())
    }
}

fn missing_pipe() -> ZfsError {
    ZfsError::Io(std::io::Error::other("child process pipe missing"))
}

/// Scan `zfs send -P` stderr for the `size\t<bytes>` line, then keep draining.
async fn scan_send_stderr(
    stderr: tokio::process::ChildStderr,
    size_tx: oneshot::Sender<Result<i64, ZfsError>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut size_tx = Some(size_tx);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(%line, "zfs send");
                if let Some(raw) = line.strip_prefix("size\t") {
                    if let Some(tx) = size_tx.take() {
                        let parsed = raw.trim().parse::<i64>().map_err(|err| {
                            ZfsError::Io(std::io::Error::other(format!(
                                "unparsable zfs send size {raw:?}: {err}"
                            )))
                        });
                        let _ = tx.send(parsed);
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Failed to read zfs send stderr");
                break;
            }
        }
    }
    // Dropping an unused sender makes the receiver fail with MissingSendSize.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_name_format() {
        let id = Ulid::from_string("01H455VB4PEX5CQJRNWQAS7B5T").unwrap();
        assert_eq!(
            snapshot_name("tank/home", id),
            "tank/home@zfsbackrest-01H455VB4PEX5CQJRNWQAS7B5T"
        );
    }

    #[test]
    fn test_match_globs_union_and_sorted() {
        let datasets = vec![
            "tank/home".to_string(),
            "tank/srv/web".to_string(),
            "tank/srv/db".to_string(),
            "pool/scratch".to_string(),
        ];
        let globs = vec!["tank/srv/*".to_string(), "tank/home".to_string()];

        let matched = match_globs(&datasets, &globs).unwrap();
        assert_eq!(
            matched,
            vec![
                "tank/home".to_string(),
                "tank/srv/db".to_string(),
                "tank/srv/web".to_string(),
            ]
        );
    }

    #[test]
    fn test_match_globs_dedupes_overlapping_patterns() {
        let datasets = vec!["tank/home".to_string()];
        let globs = vec!["tank/*".to_string(), "tank/home".to_string()];
        let matched = match_globs(&datasets, &globs).unwrap();
        assert_eq!(matched, vec!["tank/home".to_string()]);
    }

    #[test]
    fn test_match_globs_invalid_pattern() {
        let err = match_globs(&[], &["tank/[".to_string()]).unwrap_err();
        assert!(matches!(err, ZfsError::InvalidGlob { .. }));
    }
}
