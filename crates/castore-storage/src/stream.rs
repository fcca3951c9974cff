//! Byte streams and the hashing reader used to address content.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::{ReaderStream, StreamReader};

/// Boxed stream of content chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Wraps an async reader as a [`ByteStream`].
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(ReaderStream::new(reader))
}

/// Wraps an in-memory buffer as a [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Adapts a [`ByteStream`] into an [`AsyncRead`].
pub fn stream_reader(stream: ByteStream) -> StreamReader<ByteStream, Bytes> {
    StreamReader::new(stream)
}

/// Drains `stream` into memory.
pub async fn collect_bytes(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Lowercase hex SHA-1 of `data`.
pub fn signature_of(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Reader that hashes every byte passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
    len: u64,
}

impl<R> HashingReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            len: 0,
        }
    }

    /// Bytes read so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if nothing has been read.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the reader and returns `(hex signature, length)`.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.len)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        this.hasher.update(fresh);
        this.len += fresh.len() as u64;
        Poll::Ready(Ok(()))
    }
}

/// Metadata supplied with a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Desired total copies including this one; 0 disables replication.
    pub replica: u32,
    /// Lifetime from `created_at`; zero never expires.
    pub ttl: Duration,
    /// Creation time to record; defaults to now. Replica pushes carry the owner's.
    pub created_at: Option<DateTime<Utc>>,
}

impl CreateOptions {
    /// Options requesting `replica` total copies.
    pub fn with_replica(replica: u32) -> Self {
        Self {
            replica,
            ..Self::default()
        }
    }

    /// Sets the lifetime.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the creation time.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}
