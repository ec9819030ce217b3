use super::ChunkError;

pub const CHUNK_MIN_SIZE: u64 = 1024 * 1024;
pub const CHUNK_MAX_SIZE: u64 = 50 * 1024 * 1024;
pub const OPTIMAL_CHUNK_COUNT: u64 = 200;
pub const MAX_CHUNK_COUNT: u64 = 10_000;
pub const FILE_MAX_SIZE: u64 = MAX_CHUNK_COUNT * CHUNK_MAX_SIZE;

/// Inclusive byte range `[start, end]` of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub optimal_chunk_count: u64,
    pub max_chunk_count: u64,
    /// Memory-limited contexts prefer the smallest chunks.
    pub constrained: bool,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_chunk_size: CHUNK_MIN_SIZE,
            max_chunk_size: CHUNK_MAX_SIZE,
            optimal_chunk_count: OPTIMAL_CHUNK_COUNT,
            max_chunk_count: MAX_CHUNK_COUNT,
            constrained: false,
        }
    }
}

impl ChunkPolicy {
    pub fn constrained() -> Self {
        Self {
            constrained: true,
            ..Self::default()
        }
    }

    pub fn file_max_size(&self) -> u64 {
        self.max_chunk_count.saturating_mul(self.max_chunk_size)
    }
}

/// Splits `[0, file_size - 1]` into contiguous ranges. An empty file yields
/// no range at all.
pub fn compute_ranges(file_size: u64, policy: &ChunkPolicy) -> Result<Vec<ByteRange>, ChunkError> {
    let max = policy.file_max_size();
    if file_size > max {
        return Err(ChunkError::FileTooLarge {
            size: file_size,
            max,
        });
    }
    if file_size == 0 {
        return Ok(Vec::new());
    }

    let chunk_size = preferred_chunk_size(file_size, policy);
    let count = total_chunk_count(file_size, chunk_size);
    build_ranges(file_size, count, chunk_size)
}

pub fn preferred_chunk_size(file_size: u64, policy: &ChunkPolicy) -> u64 {
    if policy.constrained {
        let small = file_size.min(policy.min_chunk_size).max(1);
        if file_size.div_ceil(small) <= policy.max_chunk_count {
            return small;
        }
    }

    let potential = file_size / policy.optimal_chunk_count.max(1);
    let bounded = potential.clamp(policy.min_chunk_size, policy.max_chunk_size);
    bounded.min(file_size)
}

/// Number of full chunks of `chunk_size` in the file, never less than one.
/// A remainder is appended by [`build_ranges`].
pub fn total_chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    (file_size / chunk_size.max(1)).max(1)
}

pub fn build_ranges(
    file_size: u64,
    count: u64,
    chunk_size: u64,
) -> Result<Vec<ByteRange>, ChunkError> {
    if count == 0 {
        return Err(ChunkError::IncorrectChunkCount);
    }
    if chunk_size == 0 {
        return Err(ChunkError::IncorrectChunkSize);
    }
    if file_size == 0 {
        return Ok(Vec::new());
    }
    let covered = count
        .checked_mul(chunk_size)
        .filter(|covered| *covered <= file_size)
        .ok_or(ChunkError::ChunkedSizeLargerThanSource {
            file_size,
            count,
            chunk_size,
        })?;

    let mut ranges = Vec::with_capacity(count as usize + 1);
    for index in 0..count {
        let start = index * chunk_size;
        ranges.push(ByteRange {
            start,
            end: start + chunk_size - 1,
        });
    }
    if covered < file_size {
        ranges.push(ByteRange {
            start: covered,
            end: file_size - 1,
        });
    }
    Ok(ranges)
}
