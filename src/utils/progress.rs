//! Progress-logging IO wrappers for long-running snapshot transfers.
//!
//! Wraps an `AsyncWrite`/`AsyncRead` and logs bytes transferred (and percent
//! when an expected size is known) at a fixed interval.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant};
use tracing::info;

pub struct LoggedWriter<W> {
    tag: String,
    inner: W,
    interval: Duration,
    last_log: Instant,
    total: u64,
    expected: i64,
}

impl<W: AsyncWrite + Unpin> LoggedWriter<W> {
    pub fn new(tag: impl Into<String>, inner: W, interval: Duration, expected: i64) -> Self {
        Self {
            tag: tag.into(),
            inner,
            interval,
            last_log: Instant::now(),
            total: 0,
            expected,
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total
    }

    fn log_progress(&mut self) {
        if self.last_log.elapsed() < self.interval {
            return;
        }
        log_transfer(&self.tag, "written", self.total, self.expected);
        self.last_log = Instant::now();
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LoggedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.total += n as u64;
                self.log_progress();
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct LoggedReader<R> {
    tag: String,
    inner: R,
    interval: Duration,
    last_log: Instant,
    total: u64,
    expected: i64,
}

impl<R: AsyncRead + Unpin> LoggedReader<R> {
    pub fn new(tag: impl Into<String>, inner: R, interval: Duration, expected: i64) -> Self {
        Self {
            tag: tag.into(),
            inner,
            interval,
            last_log: Instant::now(),
            total: 0,
            expected,
        }
    }

    pub fn total_read(&self) -> u64 {
        self.total
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LoggedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                self.total += (buf.filled().len() - before) as u64;
                if self.last_log.elapsed() >= self.interval {
                    log_transfer(&self.tag, "read", self.total, self.expected);
                    self.last_log = Instant::now();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

fn log_transfer(tag: &str, verb: &str, total: u64, expected: i64) {
    if expected > 0 {
        info!(
            tag,
            total,
            expected,
            progress = total as f64 / expected as f64,
            "Bytes {verb}"
        );
    } else {
        info!(tag, total, "Bytes {verb}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_writer_counts_bytes() {
        let mut sink = Vec::new();
        let mut writer = LoggedWriter::new("test", &mut sink, Duration::from_secs(1), -1);

        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(writer.total_written(), 11);
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test]
    async fn test_reader_counts_bytes() {
        let data = b"some snapshot bytes".to_vec();
        let mut reader =
            LoggedReader::new("test", std::io::Cursor::new(data), Duration::from_secs(1), 19);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(reader.total_read(), 19);
        assert_eq!(out, b"some snapshot bytes");
    }
}
