//! S3-backed object store.
//!
//! The manifest is a plain PUT/GET. Snapshot uploads stream through a
//! multipart upload: the writer buffers part-sized chunks and hands them to a
//! background task that uploads up to `upload_threads` parts concurrently.
//! If the writer is dropped without a clean shutdown the multipart upload is
//! aborted so no partial object is ever completed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

use crate::config::S3Config;
use crate::encryption::Encryption;
use crate::storage::{
    snapshot_key, ObjectStore, SnapshotReader, SnapshotWriter, StorageError, MANIFEST_KEY,
};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    part_size: usize,
    upload_threads: usize,
}

impl S3ObjectStore {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.key.clone(),
            config.secret.clone(),
            None,
            None,
            "zfsbackrest-config",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            part_size: config.part_size as usize,
            upload_threads: config.upload_threads.max(1),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn load_manifest(&self) -> Result<Vec<u8>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(MANIFEST_KEY)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StorageError::ManifestNotFound);
                }
                return Err(StorageError::request("get manifest")(err));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(StorageError::request("read manifest body"))?;

        Ok(bytes.into_bytes().to_vec())
    }

    async fn save_manifest(&self, content: &[u8]) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(MANIFEST_KEY)
            .content_type("application/json")
            .body(ByteStream::from(Bytes::copy_from_slice(content)))
            .send()
            .await
            .map_err(StorageError::request("put manifest"))?;

        Ok(())
    }

    async fn open_snapshot_write_stream(
        &self,
        dataset: &str,
        snapshot: &str,
        size_hint: i64,
        encryption: &dyn Encryption,
    ) -> Result<SnapshotWriter, StorageError> {
        let key = snapshot_key(dataset, snapshot);
        debug!(%key, size_hint, "Opening snapshot write stream");

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(StorageError::request("create multipart upload"))?;

        let upload_id = upload.upload_id().unwrap_or_default().to_string();

        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let finished = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_multipart_upload(
            self.client.clone(),
            self.bucket.clone(),
            key,
            upload_id,
            self.upload_threads,
            rx,
            finished.clone(),
        ));

        let raw = MultipartWriter {
            buf: BytesMut::with_capacity(self.part_size),
            part_size: self.part_size,
            tx: PollSender::new(tx),
            task: Some(task),
            finished,
            closed: false,
        };

        Ok(encryption.encrypted_writer(Box::new(raw)).await?)
    }

    async fn open_snapshot_read_stream(
        &self,
        dataset: &str,
        snapshot: &str,
        encryption: &dyn Encryption,
    ) -> Result<SnapshotReader, StorageError> {
        let key = snapshot_key(dataset, snapshot);
        debug!(%key, "Opening snapshot read stream");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(StorageError::request("get snapshot object"))?;

        let reader = output.body.into_async_read();
        Ok(encryption.decrypted_reader(Box::new(reader)).await?)
    }

    async fn delete_snapshot_object(
        &self,
        dataset: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let key = snapshot_key(dataset, snapshot);
        debug!(%key, "Deleting snapshot object");

        // S3 DeleteObject succeeds for missing keys, which is exactly the
        // idempotency the delete flow relies on.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(StorageError::request("delete snapshot object"))?;

        Ok(())
    }
}

/// Consumes part-sized chunks and drives the multipart upload, bounding
/// concurrent part uploads at `upload_threads`. Aborts the upload unless the
/// writer flagged a clean finish before closing the channel.
async fn run_multipart_upload(
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    upload_threads: usize,
    mut rx: mpsc::Receiver<Bytes>,
    finished: Arc<AtomicBool>,
) -> Result<(), StorageError> {
    let result = upload_parts(&client, &bucket, &key, &upload_id, upload_threads, &mut rx).await;

    let result = match result {
        Ok(_) if !finished.load(Ordering::SeqCst) => Err(StorageError::UploadAborted),
        other => other,
    };

    match result {
        Ok(parts) => {
            client
                .complete_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(StorageError::request("complete multipart upload"))?;
            Ok(())
        }
        Err(err) => {
            warn!(%key, error = %err, "Aborting multipart upload");
            if let Err(abort_err) = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(%key, error = %abort_err, "Failed to abort multipart upload");
            }
            Err(err)
        }
    }
}

async fn upload_parts(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    upload_threads: usize,
    rx: &mut mpsc::Receiver<Bytes>,
) -> Result<Vec<CompletedPart>, StorageError> {
    let mut in_flight: JoinSet<Result<CompletedPart, StorageError>> = JoinSet::new();
    let mut completed = Vec::new();
    let mut part_number: i32 = 0;

    while let Some(chunk) = rx.recv().await {
        while in_flight.len() >= upload_threads {
            if let Some(result) = in_flight.join_next().await {
                completed.push(result.map_err(StorageError::UploadTask)??);
            }
        }

        part_number += 1;
        let request = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk));

        in_flight.spawn(async move {
            let output = request
                .send()
                .await
                .map_err(StorageError::request("upload part"))?;
            Ok(CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build())
        });
    }

    while let Some(result) = in_flight.join_next().await {
        completed.push(result.map_err(StorageError::UploadTask)??);
    }

    // An empty stream still needs one (empty) part for the upload to
    // complete.
    if completed.is_empty() {
        let output = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(1)
            .body(ByteStream::from(Bytes::new()))
            .send()
            .await
            .map_err(StorageError::request("upload empty part"))?;
        completed.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(1)
                .build(),
        );
    }

    completed.sort_by_key(|p| p.part_number());
    Ok(completed)
}

/// `AsyncWrite` front of the multipart upload. Buffers up to one part and
/// forwards full parts to the upload task; shutdown flushes the remainder,
/// marks the stream finished and waits for the task to complete the upload.
struct MultipartWriter {
    buf: BytesMut,
    part_size: usize,
    tx: PollSender<Bytes>,
    task: Option<JoinHandle<Result<(), StorageError>>>,
    finished: Arc<AtomicBool>,
    closed: bool,
}

impl MultipartWriter {
    /// Forward buffered full parts to the upload task.
    fn poll_drain_full_parts(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.buf.len() >= self.part_size {
            ready!(self.poll_send_chunk(cx, self.part_size))?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_send_chunk(&mut self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<()>> {
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = self.buf.split_to(len).freeze();
                self.tx
                    .send_item(chunk)
                    .map_err(|_| upload_stopped())?;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(upload_stopped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn upload_stopped() -> io::Error {
    io::Error::other("snapshot upload task stopped")
}

impl AsyncWrite for MultipartWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.poll_drain_full_parts(cx))?;
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_drain_full_parts(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if !self.buf.is_empty() {
                ready!(self.poll_drain_full_parts(cx))?;
                let len = self.buf.len();
                if len > 0 {
                    ready!(self.poll_send_chunk(cx, len))?;
                }
            } else if !self.closed {
                self.finished.store(true, Ordering::SeqCst);
                self.tx.close();
                self.closed = true;
            } else {
                let Some(task) = self.task.as_mut() else {
                    return Poll::Ready(Ok(()));
                };
                let result = ready!(Pin::new(task).poll(cx));
                self.task = None;
                return Poll::Ready(match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(io::Error::other(err)),
                    Err(join_err) => Err(io::Error::other(join_err)),
                });
            }
        }
    }
}
