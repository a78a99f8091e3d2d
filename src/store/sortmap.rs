//! Dense per-document sort keys, norms and coordinates.
//!
//! The `.smp` file holds a 4-byte document count followed by one dense
//! array per field: fixed-width little-endian values (1–9 bytes each)
//! indexed by docid, giving O(1) random access during filtering and
//! scoring. Geo fields store a `(latitude, longitude)` pair of equal
//! halves; scoring norms are a width-1 array. Column offsets live in the
//! host's segment metadata.

use std::sync::Arc;

use crate::error::{CallunaError, Result};
use crate::index::segment::SegmentMergeInfo;
use crate::io::buffer::{BufFile, SharedFile, FILE_BUFFER_LEN, MIN_IO_BUFFER};

/// Location of one column inside the `.smp` file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortColumn {
    pub offset: u64,
    pub width: u8,
}

/// Build-time writer; columns are staged in memory and laid out on commit.
pub struct SortMapWriter {
    out: BufFile,
    columns: Vec<(u8, BufFile)>,
}

impl SortMapWriter {
    pub fn new(smp: Arc<SharedFile>) -> Result<Self> {
        Ok(SortMapWriter {
            out: BufFile::writer(smp, FILE_BUFFER_LEN)?,
            columns: Vec::new(),
        })
    }

    /// Declare a column of `width` bytes per document (1..=9; even widths
    /// up to 8 for coordinate pairs). Returns the column index.
    pub fn add_column(&mut self, width: u8) -> Result<usize> {
        if !(1..=9).contains(&width) {
            return Err(CallunaError::invalid_argument(format!(
                "sort column width {width} outside 1..=9"
            )));
        }
        self.columns.push((width, BufFile::memory(FILE_BUFFER_LEN)?));
        Ok(self.columns.len() - 1)
    }

    /// Append one document's value to a column. Every column must receive a
    /// value for every docid, in docid order.
    pub fn push(&mut self, column: usize, value: u64) -> Result<()> {
        let (width, buf) = self
            .columns
            .get_mut(column)
            .ok_or_else(|| CallunaError::invalid_argument("unknown sort column"))?;
        buf.write_uint(value, usize::from(*width))
    }

    /// Append an encoded coordinate pair to an even-width column.
    pub fn push_coord(&mut self, column: usize, lat: u64, long: u64) -> Result<()> {
        let (width, buf) = self
            .columns
            .get_mut(column)
            .ok_or_else(|| CallunaError::invalid_argument("unknown sort column"))?;
        if *width % 2 != 0 {
            return Err(CallunaError::invalid_argument(
                "coordinate column width must be even",
            ));
        }
        let half = usize::from(*width) / 2;
        buf.write_uint(lat, half)?;
        buf.write_uint(long, half)
    }

    /// Copy one source column's surviving values, renumbered by `smi`.
    pub fn merge_column(
        &mut self,
        column: usize,
        src: &mut SortMapCursor,
        smi: &SegmentMergeInfo,
    ) -> Result<()> {
        for doc_id in 0..smi.num_docs {
            if smi.remap(doc_id).is_none() {
                continue;
            }
            let value = src.raw(doc_id)?;
            let (width, buf) = self
                .columns
                .get_mut(column)
                .ok_or_else(|| CallunaError::invalid_argument("unknown sort column"))?;
            buf.write_all(&value[..usize::from(*width)])?;
        }
        Ok(())
    }

    /// Write the header and all columns; returns each column's location.
    pub fn commit(mut self, num_docs: u32) -> Result<Vec<SortColumn>> {
        for (width, buf) in &self.columns {
            let expect = u64::from(num_docs) * u64::from(*width);
            if buf.len() as u64 != expect {
                return Err(CallunaError::invalid_argument(format!(
                    "sort column holds {} bytes, expected {expect}",
                    buf.len()
                )));
            }
        }
        self.out.write_uint(u64::from(num_docs), 4)?;
        let mut offsets = Vec::with_capacity(self.columns.len());
        let mut offset = 4u64;
        for (width, buf) in &self.columns {
            offsets.push(SortColumn {
                offset,
                width: *width,
            });
            self.out.write_all(buf.data())?;
            offset += buf.len() as u64;
        }
        self.out.flush()?;
        Ok(offsets)
    }
}

/// Pool-owned positioned reader over one bound column.
pub struct SortMapCursor {
    reader: BufFile,
    column: SortColumn,
    pub num_docs: u32,
    pub active: bool,
}

impl SortMapCursor {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(SortMapCursor {
            reader: BufFile::unbound_reader(capacity.max(MIN_IO_BUFFER))?,
            column: SortColumn {
                offset: 0,
                width: 1,
            },
            num_docs: 0,
            active: false,
        })
    }

    /// Bind the cursor to one column of a segment's sort map.
    pub fn bind(
        &mut self,
        smp: &Arc<SharedFile>,
        column: SortColumn,
        num_docs: u32,
    ) -> Result<()> {
        self.unbind();
        self.reader.link(smp, column.offset, usize::from(column.width))?;
        self.column = column;
        self.num_docs = num_docs;
        self.active = true;
        Ok(())
    }

    /// Release the current binding.
    pub fn unbind(&mut self) {
        if self.active {
            self.reader.unlink();
            self.active = false;
        }
    }

    pub fn width(&self) -> u8 {
        self.column.width
    }

    /// The document's raw column bytes.
    fn raw(&mut self, doc_id: u32) -> Result<[u8; 9]> {
        let width = usize::from(self.column.width);
        self.reader
            .seek(self.column.offset + u64::from(doc_id) * width as u64)?;
        let mut bytes = [0u8; 9];
        self.reader.read_exact(&mut bytes[..width])?;
        Ok(bytes)
    }

    /// The document's value, zero-extended.
    pub fn value(&mut self, doc_id: u32) -> Result<u64> {
        let width = usize::from(self.column.width);
        self.reader
            .seek(self.column.offset + u64::from(doc_id) * width as u64)?;
        self.reader.read_uint(width.min(8))
    }

    /// The document's `(latitude, longitude)` pair.
    pub fn coord(&mut self, doc_id: u32) -> Result<(u64, u64)> {
        let width = usize::from(self.column.width);
        let half = width / 2;
        self.reader
            .seek(self.column.offset + u64::from(doc_id) * width as u64)?;
        let lat = self.reader.read_uint(half)?;
        let long = self.reader.read_uint(half)?;
        Ok((lat, long))
    }

    pub fn capacity_bytes(&self) -> usize {
        self.reader.capacity_bytes()
    }

    pub fn shrink(&mut self) {
        self.reader.shrink();
    }
}

/// Encode a degree coordinate for a column of `width` bytes per pair:
/// `(degrees + 180) * 10^(width - 2)`.
pub fn encode_degrees(degrees: f64, width: u8) -> u64 {
    let precision = 10f64.powi(i32::from(width) - 2);
    ((degrees + 180.0) * precision) as u64
}

/// Inverse of [`encode_degrees`].
pub fn decode_degrees(value: u64, width: u8) -> f64 {
    let precision = 10f64.powi(i32::from(width) - 2);
    value as f64 / precision - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_bind_read() {
        let dir = TempDir::new().unwrap();
        let smp = SharedFile::create(dir.path().join("s.smp")).unwrap();

        let mut writer = SortMapWriter::new(Arc::clone(&smp)).unwrap();
        let prices = writer.add_column(4).unwrap();
        let norms = writer.add_column(1).unwrap();
        for doc_id in 0..10u64 {
            writer.push(prices, doc_id * 100).unwrap();
            writer.push(norms, doc_id).unwrap();
        }
        let columns = writer.commit(10).unwrap();
        assert_eq!(columns[0].offset, 4);
        assert_eq!(columns[1].offset, 4 + 40);

        let mut cursor = SortMapCursor::new(64).unwrap();
        cursor.bind(&smp, columns[0], 10).unwrap();
        assert_eq!(cursor.value(0).unwrap(), 0);
        assert_eq!(cursor.value(7).unwrap(), 700);
        cursor.bind(&smp, columns[1], 10).unwrap();
        assert_eq!(cursor.value(7).unwrap(), 7);
    }

    #[test]
    fn test_coord_round_trip() {
        let dir = TempDir::new().unwrap();
        let smp = SharedFile::create(dir.path().join("g.smp")).unwrap();

        let mut writer = SortMapWriter::new(Arc::clone(&smp)).unwrap();
        let geo = writer.add_column(8).unwrap();
        let lat = encode_degrees(48.8566, 8);
        let long = encode_degrees(2.3522, 8);
        writer.push_coord(geo, lat, long).unwrap();
        let columns = writer.commit(1).unwrap();

        let mut cursor = SortMapCursor::new(64).unwrap();
        cursor.bind(&smp, columns[0], 1).unwrap();
        let (read_lat, read_long) = cursor.coord(0).unwrap();
        assert!((decode_degrees(read_lat, 8) - 48.8566).abs() < 1e-4);
        assert!((decode_degrees(read_long, 8) - 2.3522).abs() < 1e-4);
    }

    #[test]
    fn test_commit_rejects_ragged_columns() {
        let dir = TempDir::new().unwrap();
        let smp = SharedFile::create(dir.path().join("r.smp")).unwrap();
        let mut writer = SortMapWriter::new(smp).unwrap();
        let col = writer.add_column(2).unwrap();
        writer.push(col, 1).unwrap();
        assert!(writer.commit(2).is_err());
    }
}
