use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::{ByteRange, ChunkError};

/// One chunk read from the source. `number` is 1-based, as the session API
/// expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub number: u64,
    pub range: ByteRange,
    pub data: Vec<u8>,
    pub sha256: String,
}

pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Lazily yields the chunks for a list of ranges, in order. After the first
/// failure the reader is exhausted.
pub struct ChunkReader<R> {
    source: R,
    ranges: std::vec::IntoIter<ByteRange>,
    next_number: u64,
    failed: bool,
}

impl ChunkReader<File> {
    pub fn open(path: &Path, ranges: Vec<ByteRange>) -> Result<Self, ChunkError> {
        let file = File::open(path).map_err(|source| ChunkError::Read { number: 1, source })?;
        Ok(Self::new(file, ranges))
    }
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new(source: R, ranges: Vec<ByteRange>) -> Self {
        Self {
            source,
            ranges: ranges.into_iter(),
            next_number: 1,
            failed: false,
        }
    }

    /// Numbers the first yielded chunk `first` instead of 1.
    pub fn numbered_from(mut self, first: u64) -> Self {
        self.next_number = first;
        self
    }

    fn read_range(&mut self, range: ByteRange) -> std::io::Result<Vec<u8>> {
        self.source.seek(SeekFrom::Start(range.start))?;
        let mut data = vec![0u8; range.len() as usize];
        self.source.read_exact(&mut data)?;
        Ok(data)
    }
}

impl<R: Read + Seek> Iterator for ChunkReader<R> {
    type Item = Result<Chunk, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let range = self.ranges.next()?;
        let number = self.next_number;
        self.next_number += 1;

        match self.read_range(range) {
            Ok(data) => {
                let sha256 = checksum_bytes(&data);
                Some(Ok(Chunk {
                    number,
                    range,
                    data,
                    sha256,
                }))
            }
            Err(source) => {
                self.failed = true;
                Some(Err(ChunkError::Read { number, source }))
            }
        }
    }
}

/// Reads a single chunk straight from `path`. Blocking.
pub fn read_chunk(path: &Path, number: u64, range: ByteRange) -> Result<Chunk, ChunkError> {
    let file = File::open(path).map_err(|source| ChunkError::Read { number, source })?;
    ChunkReader::new(file, vec![range])
        .numbered_from(number)
        .next()
        .unwrap_or(Err(ChunkError::IncorrectChunkCount))
}
