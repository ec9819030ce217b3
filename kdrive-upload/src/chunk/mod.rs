mod planner;
mod reader;
mod scratch;

use std::io;

use thiserror::Error;

pub use planner::{
    ByteRange, CHUNK_MAX_SIZE, CHUNK_MIN_SIZE, ChunkPolicy, FILE_MAX_SIZE, MAX_CHUNK_COUNT,
    OPTIMAL_CHUNK_COUNT, build_ranges, compute_ranges, preferred_chunk_size, total_chunk_count,
};
pub use reader::{Chunk, ChunkReader, checksum_bytes, read_chunk};
pub use scratch::ScratchStore;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("file of {size} bytes exceeds the {max} byte upload limit")]
    FileTooLarge { size: u64, max: u64 },
    #[error("{count} chunks of {chunk_size} bytes exceed a {file_size} byte source")]
    ChunkedSizeLargerThanSource {
        file_size: u64,
        count: u64,
        chunk_size: u64,
    },
    #[error("at least one chunk is expected")]
    IncorrectChunkCount,
    #[error("chunk size must be non-zero")]
    IncorrectChunkSize,
    #[error("failed to read chunk {number}: {source}")]
    Read {
        number: u64,
        #[source]
        source: io::Error,
    },
    #[error("scratch storage error: {0}")]
    Scratch(#[source] io::Error),
}
