//! In-memory fakes for the capability traits, plus a ready-made environment
//! for orchestrator tests.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use ulid::Ulid;

use crate::config::{Config, ExpiryConfig, RepositoryConfig, S3Config, UploadConcurrency};
use crate::encryption::{Encryption, EncryptionError};
use crate::repository::{AgeConfig, EncryptionConfig};
use crate::runner::Runner;
use crate::shutdown::Shutdown;
use crate::storage::{
    snapshot_key, ObjectStore, SnapshotReader, SnapshotWriter, StorageError,
};
use crate::zfs::{match_globs, snapshot_name, RecvOptions, SnapshotProvider, ZfsError};

pub fn test_config(included: &[String]) -> Config {
    Config {
        repository: RepositoryConfig {
            included_datasets: included.to_vec(),
            s3: S3Config {
                endpoint: "http://127.0.0.1:9000".to_string(),
                bucket: "test".to_string(),
                key: "key".to_string(),
                secret: "secret".to_string(),
                region: "us-east-1".to_string(),
                part_size: 8 * 1024 * 1024,
                upload_threads: 1,
            },
            expiry: ExpiryConfig {
                full: Duration::from_secs(336 * 3600),
                diff: Duration::from_secs(120 * 3600),
                incr: Duration::from_secs(24 * 3600),
            },
        },
        debug: false,
        upload_concurrency: UploadConcurrency::default(),
    }
}

/// Deterministic payload the fake provider streams for a snapshot.
pub fn snapshot_payload(dataset: &str, id: Ulid, parent: Option<Ulid>) -> Vec<u8> {
    match parent {
        Some(parent) => format!("snap:{dataset}@{id};parent:{parent}").into_bytes(),
        None => format!("snap:{dataset}@{id}").into_bytes(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvCall {
    pub dataset: String,
    pub id: Ulid,
    pub content: Vec<u8>,
}

/// Fake snapshot provider over an in-memory dataset/snapshot set.
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    datasets: Mutex<BTreeSet<String>>,
    snapshots: Mutex<BTreeSet<String>>,
    held: Mutex<BTreeSet<String>>,
    deleted_snapshots: Mutex<Vec<String>>,
    recv_calls: Mutex<Vec<RecvCall>>,
}

impl MemorySnapshots {
    pub fn new(datasets: &[&str]) -> Self {
        let provider = Self::default();
        for dataset in datasets {
            provider.add_dataset(dataset);
        }
        provider
    }

    pub fn add_dataset(&self, dataset: &str) {
        self.datasets.lock().unwrap().insert(dataset.to_string());
    }

    pub fn has_snapshot(&self, dataset: &str, id: Ulid) -> bool {
        self.snapshots
            .lock()
            .unwrap()
            .contains(&snapshot_name(dataset, id))
    }

    pub fn is_held(&self, dataset: &str, id: Ulid) -> bool {
        self.held
            .lock()
            .unwrap()
            .contains(&snapshot_name(dataset, id))
    }

    pub fn deleted_snapshots(&self) -> Vec<String> {
        self.deleted_snapshots.lock().unwrap().clone()
    }

    pub fn recv_calls(&self) -> Vec<RecvCall> {
        self.recv_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotProvider for MemorySnapshots {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, ZfsError> {
        Ok(self.datasets.lock().unwrap().contains(dataset))
    }

    async fn list_datasets(&self) -> Result<Vec<String>, ZfsError> {
        Ok(self.datasets.lock().unwrap().iter().cloned().collect())
    }

    async fn list_datasets_with_globs(&self, globs: &[String]) -> Result<Vec<String>, ZfsError> {
        let datasets = self.list_datasets().await?;
        match_globs(&datasets, globs)
    }

    async fn snapshot_exists(&self, dataset: &str, id: Ulid) -> Result<bool, ZfsError> {
        Ok(self.has_snapshot(dataset, id))
    }

    async fn create_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot_name(dataset, id));
        Ok(())
    }

    async fn delete_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);
        if !self.snapshots.lock().unwrap().remove(&snap) {
            return Err(ZfsError::CommandFailed {
                args: vec!["destroy".to_string(), snap],
                code: Some(1),
                stderr: "could not find any snapshots to destroy".to_string(),
            });
        }
        self.deleted_snapshots.lock().unwrap().push(snap);
        Ok(())
    }

    async fn hold_snapshot(&self, dataset: &str, id: Ulid) -> Result<(), ZfsError> {
        self.held.lock().unwrap().insert(snapshot_name(dataset, id));
        Ok(())
    }

    async fn release_snapshot(
        &self,
        dataset: &str,
        id: Ulid,
        ignore_missing: bool,
    ) -> Result<(), ZfsError> {
        let snap = snapshot_name(dataset, id);
        if !self.held.lock().unwrap().remove(&snap) && !ignore_missing {
            return Err(ZfsError::CommandFailed {
                args: vec!["release".to_string(), snap],
                code: Some(1),
                stderr: "no such tag on this dataset".to_string(),
            });
        }
        Ok(())
    }

    async fn send(
        &self,
        dataset: &str,
        id: Ulid,
        parent: Option<Ulid>,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i64, ZfsError> {
        if !self.has_snapshot(dataset, id) {
            return Err(ZfsError::CommandFailed {
                args: vec!["send".to_string(), snapshot_name(dataset, id)],
                code: Some(1),
                stderr: "snapshot does not exist".to_string(),
            });
        }

        let payload = snapshot_payload(dataset, id, parent);
        dst.write_all(&payload).await?;
        Ok(payload.len() as i64)
    }

    async fn recv(
        &self,
        dataset: &str,
        id: Ulid,
        src: &mut (dyn AsyncRead + Send + Unpin),
        _opts: RecvOptions,
    ) -> Result<(), ZfsError> {
        let mut content = Vec::new();
        src.read_to_end(&mut content).await?;

        // Receiving creates the snapshot on the destination dataset.
        self.add_dataset(dataset);
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot_name(dataset, id));

        self.recv_calls.lock().unwrap().push(RecvCall {
            dataset: dataset.to_string(),
            id,
            content,
        });
        Ok(())
    }
}

/// Fake object store over in-memory maps, recording operation order.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    manifest: Mutex<Option<Vec<u8>>>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    deletions: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, dataset: &str, snapshot: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&snapshot_key(dataset, snapshot))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn deletions(&self) -> Vec<String> {
        self.deletions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn load_manifest(&self) -> Result<Vec<u8>, StorageError> {
        self.manifest
            .lock()
            .unwrap()
            .clone()
            .ok_or(StorageError::ManifestNotFound)
    }

    async fn save_manifest(&self, content: &[u8]) -> Result<(), StorageError> {
        *self.manifest.lock().unwrap() = Some(content.to_vec());
        Ok(())
    }

    async fn open_snapshot_write_stream(
        &self,
        dataset: &str,
        snapshot: &str,
        _size_hint: i64,
        encryption: &dyn Encryption,
    ) -> Result<SnapshotWriter, StorageError> {
        let writer = MemoryWriter {
            key: snapshot_key(dataset, snapshot),
            buf: Vec::new(),
            objects: self.objects.clone(),
            stored: false,
        };
        Ok(encryption.encrypted_writer(Box::new(writer)).await?)
    }

    async fn open_snapshot_read_stream(
        &self,
        dataset: &str,
        snapshot: &str,
        encryption: &dyn Encryption,
    ) -> Result<SnapshotReader, StorageError> {
        let content = self
            .object(dataset, snapshot)
            .ok_or_else(|| StorageError::Request {
                context: "get snapshot object",
                source: anyhow::anyhow!("object not found"),
            })?;
        Ok(encryption
            .decrypted_reader(Box::new(std::io::Cursor::new(content)))
            .await?)
    }

    async fn delete_snapshot_object(
        &self,
        dataset: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let key = snapshot_key(dataset, snapshot);
        // Deleting a missing object succeeds, matching S3 semantics.
        self.objects.lock().unwrap().remove(&key);
        self.deletions.lock().unwrap().push(key);
        Ok(())
    }
}

/// Buffers writes and stores the object on shutdown.
struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    stored: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.stored {
            let key = self.key.clone();
            let content = std::mem::take(&mut self.buf);
            self.objects.lock().unwrap().insert(key, content);
            self.stored = true;
        }
        Poll::Ready(Ok(()))
    }
}

/// Identity encryption: ciphertext equals plaintext. Keeps orchestrator tests
/// byte-comparable.
pub struct PlainEncryption;

#[async_trait]
impl Encryption for PlainEncryption {
    async fn encrypted_writer(
        &self,
        dst: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, EncryptionError> {
        Ok(dst)
    }

    async fn decrypted_reader(
        &self,
        src: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, EncryptionError> {
        Ok(src)
    }
}

/// Ready-made orchestrator test environment.
pub struct TestEnv {
    pub provider: Arc<MemorySnapshots>,
    pub storage: Arc<MemoryObjectStore>,
    pub datasets: Vec<String>,
    recipient: String,
}

impl TestEnv {
    pub fn new(datasets: &[&str]) -> Self {
        let identity = age::x25519::Identity::generate();
        Self {
            provider: Arc::new(MemorySnapshots::new(datasets)),
            storage: Arc::new(MemoryObjectStore::new()),
            datasets: datasets.iter().map(|s| s.to_string()).collect(),
            recipient: identity.to_public().to_string(),
        }
    }

    pub fn encryption_config(&self) -> EncryptionConfig {
        EncryptionConfig {
            age: AgeConfig {
                recipient_public_key: self.recipient.clone(),
            },
        }
    }

    pub async fn runner_with_new_repository(&self) -> Runner {
        self.runner_with_config(test_config(&self.datasets)).await
    }

    pub async fn runner_with_config(&self, config: Config) -> Runner {
        let mut runner = Runner::with_new_repository(
            Arc::new(config),
            self.provider.clone(),
            self.storage.clone(),
            self.encryption_config(),
            Shutdown::new(),
        )
        .await
        .expect("failed to initialize test repository");

        // Orchestrator tests compare raw bytes, so swap in the identity
        // encryption.
        runner.set_encryption(Arc::new(PlainEncryption));
        runner
    }
}
