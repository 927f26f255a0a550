//! Input side of the pipeline
//!
//! A [`ByteSource`] is anything that can hand out the next bytes of the file;
//! [`ChunkReader`] turns it into numbered, part-sized chunks.

pub mod chunk_reader;
pub mod http;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use chunk_reader::{Chunk, ChunkReader};
pub use http::HttpSource;

/// Sequential byte stream with no seek or rewind
#[async_trait]
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Adapts any tokio `AsyncRead` (files, pipes, in-memory cursors)
pub struct ReaderSource<R> {
    inner: R,
}

impl<R> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R> ByteSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).await
    }
}
