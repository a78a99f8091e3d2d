//! Segment file naming and the merge descriptor.
//!
//! A segment is one self-contained generation of index files. During a
//! merge, each source segment is described by a [`SegmentMergeInfo`] whose
//! doc map renumbers surviving docids into the destination segment.

use std::path::{Path, PathBuf};

use crate::index::deletion::DeletionBitmap;

/// File-name layout of one segment.
#[derive(Debug, Clone)]
pub struct SegmentFiles {
    dir: PathBuf,
    name: String,
}

impl SegmentFiles {
    pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        SegmentFiles {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
        }
    }

    fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.name))
    }

    /// Posting doc/freq streams with embedded skip chains.
    pub fn frq(&self) -> PathBuf {
        self.path("frq")
    }

    /// Posting position streams.
    pub fn prx(&self) -> PathBuf {
        self.path("prx")
    }

    /// Full term dictionary.
    pub fn tis(&self) -> PathBuf {
        self.path("tis")
    }

    /// Coarse term dictionary index.
    pub fn tii(&self) -> PathBuf {
        self.path("tii")
    }

    /// Document pointer index (5-byte offsets).
    pub fn fdi(&self) -> PathBuf {
        self.path("fdi")
    }

    /// Document field/snippet data.
    pub fn fda(&self) -> PathBuf {
        self.path("fda")
    }

    /// Sort/score map.
    pub fn smp(&self) -> PathBuf {
        self.path("smp")
    }

    /// Deleted-document bitmap.
    pub fn del(&self) -> PathBuf {
        self.path("del")
    }
}

/// Renumbering descriptor for one source segment of a merge.
#[derive(Debug)]
pub struct SegmentMergeInfo {
    /// First docid assigned to this segment's survivors in the destination.
    pub base: u32,
    pub num_docs: u32,
    pub bitmap: Option<DeletionBitmap>,
    /// `deleted_before[d]` = deleted docids below `d`.
    deleted_before: Vec<u32>,
}

impl SegmentMergeInfo {
    pub fn new(base: u32, num_docs: u32, bitmap: Option<DeletionBitmap>) -> Self {
        let mut deleted_before = Vec::with_capacity(num_docs as usize + 1);
        let mut seen = 0u32;
        for doc_id in 0..=num_docs {
            deleted_before.push(seen);
            if doc_id < num_docs
                && bitmap
                    .as_ref()
                    .map(|b| b.is_deleted(doc_id))
                    .unwrap_or(false)
            {
                seen += 1;
            }
        }
        SegmentMergeInfo {
            base,
            num_docs,
            bitmap,
            deleted_before,
        }
    }

    /// Destination docid for a source docid, or `None` when deleted.
    pub fn remap(&self, doc_id: u32) -> Option<u32> {
        if self.is_deleted(doc_id) {
            return None;
        }
        Some(self.base + doc_id - self.deleted_before[doc_id as usize])
    }

    pub fn is_deleted(&self, doc_id: u32) -> bool {
        self.bitmap
            .as_ref()
            .map(|b| b.is_deleted(doc_id))
            .unwrap_or(false)
    }

    /// Number of documents this segment contributes to the destination.
    pub fn survivors(&self) -> u32 {
        self.num_docs - self.deleted_before[self.num_docs as usize]
    }
}
