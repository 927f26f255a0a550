//! Fixed-size chunking of a byte stream
//!
//! Chunks are filled completely before being handed out, so every chunk but
//! the last is exactly `part_size` bytes no matter how the source fragments
//! its reads.

use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use tracing::{debug, trace};

use super::ByteSource;
use crate::error::{FerryError, Result};

/// One part-sized slice of the source
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 1-based, dense, assigned in read order
    pub sequence_number: u32,
    /// Chunk bytes, at most `part_size` long
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(sequence_number: u32, payload: Bytes) -> Self {
        Self {
            sequence_number,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Lazy, finite, non-restartable chunk sequence over a [`ByteSource`]
pub struct ChunkReader<S> {
    source: S,
    part_size: usize,
    next_sequence: u32,
    bytes_read: u64,
    exhausted: bool,
}

impl<S: ByteSource> ChunkReader<S> {
    /// Create a reader producing chunks of `part_size` bytes
    pub fn new(source: S, part_size: usize) -> Self {
        assert!(part_size > 0, "part size must be positive");
        Self {
            source,
            part_size,
            next_sequence: 1,
            bytes_read: 0,
            exhausted: false,
        }
    }

    /// Read the next chunk, or `None` once the stream is exhausted
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = BytesMut::zeroed(self.part_size);
        let mut filled = 0;

        while filled < self.part_size {
            match self.source.read(&mut buf[filled..]).await {
                Ok(0) => {
                    self.exhausted = true;
                    break;
                }
                Ok(n) => {
                    trace!("Read {} bytes into part {}", n, self.next_sequence);
                    filled += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.exhausted = true;
                    return Err(FerryError::SourceRead {
                        after_part: self.next_sequence - 1,
                        source: e,
                    });
                }
            }
        }

        if filled == 0 {
            debug!(
                "Source exhausted after {} parts ({} bytes)",
                self.next_sequence - 1,
                self.bytes_read
            );
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk::new(self.next_sequence, buf.freeze());
        self.next_sequence += 1;
        self.bytes_read += filled as u64;

        Ok(Some(chunk))
    }

    /// Number of chunks handed out so far
    pub fn chunks_read(&self) -> u32 {
        self.next_sequence - 1
    }

    /// Total bytes handed out so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }
}
