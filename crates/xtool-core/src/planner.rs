//! Chunk planning: split the first input port's rows into contiguous ranges
//! that are processed by independent external tool invocations.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// How the rows of the first input port are distributed over chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "value", rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// One chunk holding all rows.
    #[default]
    EntireTable,
    /// One chunk per row.
    IndividualRow,
    /// Chunks of at most `n` rows.
    ChunksOfSize(usize),
    /// At most `n` chunks.
    NrChunks(usize),
}

impl ChunkPolicy {
    /// Reject values that cannot produce a plan.
    pub fn validate(&self) -> Result<()> {
        match self {
            ChunkPolicy::ChunksOfSize(0) => Err(CoreError::InvalidPolicy(
                "chunk size must be at least 1".to_string(),
            )),
            ChunkPolicy::NrChunks(0) => Err(CoreError::InvalidPolicy(
                "number of chunks must be at least 1".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Result of planning: `chunk_count` ranges of `rows_per_chunk` rows each,
/// the last one possibly shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub row_count: usize,
    pub chunk_count: usize,
    pub rows_per_chunk: usize,
}

impl ChunkPlan {
    /// Plan `row_count` rows under `policy`.
    ///
    /// Always yields at least one chunk; a table without rows still gets one
    /// (empty) chunk so the tool runs once.
    pub fn new(row_count: usize, policy: ChunkPolicy) -> Result<Self> {
        policy.validate()?;
        if row_count == 0 {
            return Ok(Self {
                row_count,
                chunk_count: 1,
                rows_per_chunk: 0,
            });
        }

        let requested = match policy {
            ChunkPolicy::EntireTable => 1,
            ChunkPolicy::IndividualRow => row_count,
            ChunkPolicy::ChunksOfSize(size) => row_count.div_ceil(size),
            ChunkPolicy::NrChunks(n) => row_count.min(n),
        }
        .max(1);

        let rows_per_chunk = row_count.div_ceil(requested);
        // Even redistribution can leave trailing chunks empty (5 rows over 4
        // chunks); drop them.
        let chunk_count = row_count.div_ceil(rows_per_chunk);

        Ok(Self {
            row_count,
            chunk_count,
            rows_per_chunk,
        })
    }

    /// Half-open row range of chunk `idx`.
    pub fn range(&self, idx: usize) -> Range<usize> {
        let start = (idx * self.rows_per_chunk).min(self.row_count);
        let end = (start + self.rows_per_chunk).min(self.row_count);
        start..end
    }

    pub fn ranges(&self) -> Vec<Range<usize>> {
        (0..self.chunk_count).map(|i| self.range(i)).collect()
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_count > 1
    }
}
