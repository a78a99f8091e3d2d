//! Per-worker resource pool.
//!
//! Each worker thread owns exactly one [`MemoryPool`]: the posting cursor,
//! the shared dictionary and document readers, the sort-map cursor, the
//! scratch buffers and the evaluator's result-set buckets all live here and
//! are reused across queries. Pools are never shared for concurrent
//! mutation; only the file descriptors behind them are (each guarded by its
//! own mutex). Periodic [`recycle`](MemoryPool::recycle) bounds long-run
//! growth from geometric buffer expansion.

use log::debug;

use crate::error::Result;
use crate::index::posting::PostingCursor;
use crate::io::buffer::{BufFile, FILE_BUFFER_LEN, MIN_IO_BUFFER};
use crate::search::hits::HitList;
use crate::store::sortmap::SortMapCursor;

/// Pool sizing knobs.
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Base capacity of file-backed buffers.
    pub buffer_capacity: usize,
    /// Initial entry capacity of result-set buckets.
    pub bucket_capacity: usize,
    /// Tracked usage above which [`MemoryPool::recycle`] reclaims buffers.
    pub usage_ceiling: usize,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        MemoryPoolConfig {
            buffer_capacity: FILE_BUFFER_LEN,
            bucket_capacity: 1024,
            usage_ceiling: 8 * 1024 * 1024,
        }
    }
}

/// One worker's bundle of reusable buffers.
pub struct MemoryPool {
    /// Bound posting list cursor.
    pub posting: PostingCursor,
    /// Bound sort-map column cursor.
    pub score_map: SortMapCursor,
    /// Current result set.
    pub hits: HitList,
    /// Previous result set, swapped with `hits` by binary operators.
    pub iter: HitList,
    /// Saved result-set banks for nested sub-expressions.
    pub banks: Vec<HitList>,
    /// Shared `.tis` reader, linked per dictionary lookup.
    pub dict_reader: BufFile,
    /// Shared `.fdi` reader, linked per document fetch.
    pub doc_index: BufFile,
    /// Shared `.fda` reader, linked per document fetch.
    pub doc_data: BufFile,
    /// Scratch: decompressed field output.
    pub scratch0: BufFile,
    /// Scratch: decompressed document blob.
    pub scratch1: BufFile,
    /// Scratch: staging for compressed bytes.
    pub scratch2: BufFile,
    config: MemoryPoolConfig,
}

impl MemoryPool {
    /// Build the whole pool; either every buffer is allocated or the pool
    /// is not constructed at all.
    pub fn new(config: MemoryPoolConfig) -> Result<Self> {
        Ok(MemoryPool {
            posting: PostingCursor::new(config.buffer_capacity)?,
            score_map: SortMapCursor::new(MIN_IO_BUFFER)?,
            hits: HitList::new(config.bucket_capacity),
            iter: HitList::new(config.bucket_capacity),
            banks: Vec::new(),
            dict_reader: BufFile::unbound_reader(config.buffer_capacity)?,
            doc_index: BufFile::unbound_reader(MIN_IO_BUFFER)?,
            doc_data: BufFile::unbound_reader(config.buffer_capacity)?,
            scratch0: BufFile::memory(config.buffer_capacity)?,
            scratch1: BufFile::memory(config.buffer_capacity)?,
            scratch2: BufFile::memory(config.buffer_capacity)?,
            config,
        })
    }

    pub fn config(&self) -> &MemoryPoolConfig {
        &self.config
    }

    /// Bytes currently reserved across the pool's buffers.
    pub fn usage(&self) -> usize {
        self.posting.capacity_bytes()
            + self.score_map.capacity_bytes()
            + self.hits.capacity_bytes()
            + self.iter.capacity_bytes()
            + self.banks.iter().map(HitList::capacity_bytes).sum::<usize>()
            + self.dict_reader.capacity_bytes()
            + self.doc_index.capacity_bytes()
            + self.doc_data.capacity_bytes()
            + self.scratch0.capacity_bytes()
            + self.scratch1.capacity_bytes()
            + self.scratch2.capacity_bytes()
    }

    /// Reclaim grown buffers once usage exceeds the configured ceiling.
    /// Called by the owning worker between requests; no cross-worker
    /// coordination is involved.
    pub fn recycle(&mut self) {
        let usage = self.usage();
        if usage <= self.config.usage_ceiling {
            return;
        }
        debug!(
            "recycling pool: {usage} bytes over ceiling {}",
            self.config.usage_ceiling
        );
        self.posting.shrink();
        self.score_map.shrink();
        self.hits.shrink(self.config.bucket_capacity);
        self.iter.shrink(self.config.bucket_capacity);
        self.banks.clear();
        self.dict_reader.shrink();
        self.doc_index.shrink();
        self.doc_data.shrink();
        self.scratch0.shrink();
        self.scratch1.shrink();
        self.scratch2.shrink();
    }
}
