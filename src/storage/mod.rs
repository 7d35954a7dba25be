//! Object store abstraction.
//!
//! The repository is opaque to the remote: one unencrypted JSON manifest at a
//! fixed key plus AEAD-encrypted snapshot objects under `snaps/`.

mod s3;

pub use s3::S3ObjectStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::encryption::{Encryption, EncryptionError};

/// Remote key of the manifest object. Not encrypted; holds metadata and the
/// recipient public key only.
pub const MANIFEST_KEY: &str = "zfsbackrest_store_v1.json";

/// Remote key of a snapshot object.
pub fn snapshot_key(dataset: &str, snapshot: &str) -> String {
    format!("snaps/{dataset}/{snapshot}")
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("manifest object not found")]
    ManifestNotFound,

    #[error("object store request failed: {context}")]
    Request {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("upload task failed")]
    UploadTask(#[source] tokio::task::JoinError),

    #[error("snapshot upload aborted before completion")]
    UploadAborted,

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn request<E>(context: &'static str) -> impl FnOnce(E) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |err| StorageError::Request {
            context,
            source: anyhow::Error::new(err),
        }
    }
}

/// Write half of a snapshot upload. Shutdown flushes the AEAD footer (when
/// wrapped by an encryption layer) and waits for the transport to acknowledge
/// the stored object.
pub type SnapshotWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a snapshot download.
pub type SnapshotReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn load_manifest(&self) -> Result<Vec<u8>, StorageError>;

    async fn save_manifest(&self, content: &[u8]) -> Result<(), StorageError>;

    /// Open an encrypted write stream for a snapshot object. `size_hint` of
    /// -1 signals an unknown streaming size.
    async fn open_snapshot_write_stream(
        &self,
        dataset: &str,
        snapshot: &str,
        size_hint: i64,
        encryption: &dyn Encryption,
    ) -> Result<SnapshotWriter, StorageError>;

    /// Open a decrypted read stream for a snapshot object.
    async fn open_snapshot_read_stream(
        &self,
        dataset: &str,
        snapshot: &str,
        encryption: &dyn Encryption,
    ) -> Result<SnapshotReader, StorageError>;

    /// Delete a snapshot object. Deleting a missing object succeeds.
    async fn delete_snapshot_object(
        &self,
        dataset: &str,
        snapshot: &str,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_key_layout() {
        assert_eq!(
            snapshot_key("tank/home", "01H455VB4PEX5CQJRNWQAS7B5T"),
            "snaps/tank/home/01H455VB4PEX5CQJRNWQAS7B5T"
        );
    }
}
