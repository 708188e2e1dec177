//! Chunk planning for resumable blob uploads
//!
//! A source of length `L` is split into `L / C` ranges of `C` bytes followed by one trailing
//! range of `L % C` bytes. A zero remainder produces no trailing range. Sources shorter than
//! one chunk produce no ranges at all; callers upload those monolithically.

use crate::error::{RegistryError, Result};
use bytes::Bytes;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

/// Exclusive bound on the number of whole chunks, the largest signed 32-bit value.
///
/// The chunk size doubles while the count reaches it.
pub const MAX_CHUNK_COUNT: u64 = i32::MAX as u64;

/// One inclusive byte range `[begin, end]` of the source with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    pub begin: u64,
    pub end: u64,
    pub payload: Bytes,
}

impl ChunkRange {
    pub fn size(&self) -> u64 {
        self.end - self.begin + 1
    }

    /// `Content-Range` value for a chunk PATCH
    pub fn content_range(&self) -> String {
        format!("{}-{}", self.begin, self.end)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    chunk_size: u64,
}

impl ChunkPlanner {
    pub fn new(chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RegistryError::InvalidArgument(
                "chunk size must be greater than 0".to_string(),
            ));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Plan a seekable source from its current position to its end
    pub fn plan<R: Read + Seek>(&self, source: &mut R) -> Result<Vec<ChunkRange>> {
        let start = source.stream_position()?;
        let end = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(start))?;
        self.plan_with_length(source, end.saturating_sub(start))
    }

    /// Plan a forward-only source whose length is known up front
    pub fn plan_with_length<R: Read>(&self, source: &mut R, length: u64) -> Result<Vec<ChunkRange>> {
        let layout = chunk_layout(length, self.chunk_size)?;
        let mut ranges = Vec::with_capacity(layout.len());

        for (begin, end) in layout {
            let size = end - begin + 1;
            let size = usize::try_from(size).map_err(|_| {
                RegistryError::InvalidArgument(format!("chunk of {} bytes does not fit in memory", size))
            })?;
            let mut buffer = vec![0u8; size];
            source.read_exact(&mut buffer).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("source ended before chunk [{}, {}] was read", begin, end),
                    )
                } else {
                    e
                }
            })?;
            ranges.push(ChunkRange {
                begin,
                end,
                payload: Bytes::from(buffer),
            });
        }

        Ok(ranges)
    }
}

/// Chunk size actually used for a source of `length` bytes
pub fn effective_chunk_size(length: u64, chunk_size: u64) -> Result<u64> {
    if chunk_size == 0 {
        return Err(RegistryError::InvalidArgument(
            "chunk size must be greater than 0".to_string(),
        ));
    }
    let mut block = chunk_size;
    while length / block >= MAX_CHUNK_COUNT {
        block = block.saturating_mul(2);
    }
    Ok(block)
}

/// Inclusive `(begin, end)` pairs for a source of `length` bytes, without reading it
pub fn chunk_layout(length: u64, chunk_size: u64) -> Result<Vec<(u64, u64)>> {
    let block = effective_chunk_size(length, chunk_size)?;
    if length == 0 || length < chunk_size {
        return Ok(Vec::new());
    }

    let count = length / block;
    let remainder = length % block;

    let mut layout: Vec<(u64, u64)> = (0..count)
        .map(|i| (i * block, i * block + block - 1))
        .collect();
    if remainder > 0 {
        layout.push((count * block, count * block + remainder - 1));
    }
    Ok(layout)
}
