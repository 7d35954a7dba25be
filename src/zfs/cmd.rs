//! Subprocess plumbing for the `zfs` binary.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ZfsError {
    #[error("failed to spawn zfs {args:?}")]
    Spawn {
        args: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("zfs {args:?} failed with {code:?}: {stderr}")]
    CommandFailed {
        args: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid glob pattern: {pattern}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("zfs send did not announce a stream size")]
    MissingSendSize,

    #[error("zfs send stream truncated: announced {announced} bytes, streamed {streamed}")]
    SendTruncated { announced: i64, streamed: i64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ZfsError {
    /// `zfs list` exits with code 1 when the queried object does not exist.
    pub fn is_exit_code(&self, expected: i32) -> bool {
        matches!(self, ZfsError::CommandFailed { code: Some(c), .. } if *c == expected)
    }
}

/// Run a zfs command to completion and return its stdout.
pub(crate) async fn run_zfs(args: &[&str]) -> Result<Vec<u8>, ZfsError> {
    debug!(?args, "Running zfs command");

    let owned_args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let output = Command::new("zfs")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| ZfsError::Spawn {
            args: owned_args.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ZfsError::CommandFailed {
            args: owned_args,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!(?args, stdout_len = output.stdout.len(), "zfs command finished");

    Ok(output.stdout)
}

/// Spawn a zfs command with stdout and stderr piped for streaming.
pub(crate) fn spawn_zfs_streaming(args: &[&str], stdin: Stdio) -> Result<Child, ZfsError> {
    debug!(?args, "Spawning zfs command for streaming");

    Command::new("zfs")
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ZfsError::Spawn {
            args: args.iter().map(|s| s.to_string()).collect(),
            source,
        })
}
