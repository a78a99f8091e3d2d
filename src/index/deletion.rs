//! Bitmap-based logical deletion for a segment.
//!
//! One bit per docid, byte-packed, with a header recording the document
//! count and the number of set bits. Deleted documents are dropped and
//! renumbered at segment merge time.

use bit_vec::BitVec;

use crate::error::{CallunaError, Result};
use crate::io::buffer::BufFile;

/// Deletion state for one segment.
#[derive(Debug, Clone)]
pub struct DeletionBitmap {
    bits: BitVec,
    num_docs: u32,
    deleted: u32,
}

impl DeletionBitmap {
    /// Create an all-live bitmap for `num_docs` documents.
    pub fn new(num_docs: u32) -> Self {
        DeletionBitmap {
            bits: BitVec::from_elem(num_docs as usize, false),
            num_docs,
            deleted: 0,
        }
    }

    /// Mark a document deleted; returns whether the bit was newly set.
    pub fn delete(&mut self, doc_id: u32) -> Result<bool> {
        if doc_id >= self.num_docs {
            return Err(CallunaError::invalid_argument(format!(
                "docid {doc_id} out of range for segment of {} documents",
                self.num_docs
            )));
        }
        if self.bits.get(doc_id as usize) == Some(true) {
            return Ok(false);
        }
        self.bits.set(doc_id as usize, true);
        self.deleted += 1;
        Ok(true)
    }

    pub fn is_deleted(&self, doc_id: u32) -> bool {
        self.bits.get(doc_id as usize) == Some(true)
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn deleted_count(&self) -> u32 {
        self.deleted
    }

    /// Documents that survive a merge.
    pub fn live_count(&self) -> u32 {
        self.num_docs - self.deleted
    }

    /// Write header and packed bits.
    pub fn save(&self, out: &mut BufFile) -> Result<()> {
        out.write_uint(u64::from(self.num_docs), 4)?;
        out.write_uint(u64::from(self.deleted), 4)?;
        out.write_all(&self.bits.to_bytes())?;
        out.flush()
    }

    /// Read a bitmap written by [`save`](Self::save).
    pub fn load(input: &mut BufFile) -> Result<Self> {
        let num_docs = input.read_uint(4)? as u32;
        let deleted = input.read_uint(4)? as u32;
        let mut packed = vec![0u8; num_docs.div_ceil(8) as usize];
        input.read_exact(&mut packed)?;
        let mut bits = BitVec::from_bytes(&packed);
        bits.truncate(num_docs as usize);
        Ok(DeletionBitmap {
            bits,
            num_docs,
            deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_and_count() {
        let mut bitmap = DeletionBitmap::new(20);
        assert!(bitmap.delete(3).unwrap());
        assert!(bitmap.delete(17).unwrap());
        assert!(!bitmap.delete(3).unwrap());
        assert_eq!(bitmap.deleted_count(), 2);
        assert_eq!(bitmap.live_count(), 18);
        assert!(bitmap.is_deleted(3));
        assert!(!bitmap.is_deleted(4));
        assert!(bitmap.delete(20).is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut bitmap = DeletionBitmap::new(13);
        bitmap.delete(0).unwrap();
        bitmap.delete(7).unwrap();
        bitmap.delete(12).unwrap();

        let mut buf = BufFile::memory(64).unwrap();
        bitmap.save(&mut buf).unwrap();
        buf.seek(0).unwrap();
        let loaded = DeletionBitmap::load(&mut buf).unwrap();

        assert_eq!(loaded.num_docs(), 13);
        assert_eq!(loaded.deleted_count(), 3);
        for doc_id in 0..13 {
            assert_eq!(loaded.is_deleted(doc_id), bitmap.is_deleted(doc_id));
        }
    }
}
