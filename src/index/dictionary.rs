//! Front-coded term dictionary with a coarse in-memory index tier.
//!
//! The full dictionary (`.tis`) holds one record per term in ascending
//! `(field, term)` order, each front-coded against its predecessor. Every
//! [`INDEX_INTERVAL`]th record restarts the coding (empty prefix, pointer
//! deltas against zero) and is copied, with its `.tis` offset, into the
//! coarse index (`.tii`), which is small enough to load whole and binary
//! search. A lookup therefore costs one in-memory binary search plus a
//! linear decode of at most [`INDEX_INTERVAL`] records.
//!
//! Both files begin with a 4-byte term count, rewritten on commit.

use std::sync::Arc;

use log::debug;

use crate::error::{CallunaError, Result};
use crate::index::posting::TermPointers;
use crate::io::buffer::{BufFile, SharedFile, FILE_BUFFER_LEN, MIN_IO_BUFFER};

/// Terms per coarse-index entry.
pub const INDEX_INTERVAL: u32 = 128;

/// Longest accepted term, in bytes.
pub const MAX_TERM_LEN: usize = 99;

/// A decoded dictionary record.
#[derive(Clone, Debug, PartialEq)]
pub struct TermRecord {
    pub field: u8,
    pub term: String,
    pub ptrs: TermPointers,
}

/// Front-coding state carried between consecutive records.
#[derive(Default)]
struct RecordState {
    term: Vec<u8>,
    freq_ptr: u64,
    prox_ptr: u64,
}

impl RecordState {
    fn clear(&mut self) {
        self.term.clear();
        self.freq_ptr = 0;
        self.prox_ptr = 0;
    }
}

fn write_record(
    out: &mut BufFile,
    state: &mut RecordState,
    field: u8,
    term: &[u8],
    ptrs: &TermPointers,
) -> Result<()> {
    let shared = state
        .term
        .iter()
        .zip(term.iter())
        .take_while(|(a, b)| a == b)
        .count();
    out.write_vint(shared as u32)?;
    out.write_vint((term.len() - shared) as u32)?;
    out.write_all(&term[shared..])?;
    out.write_vint(u32::from(field))?;
    out.write_vint(ptrs.df)?;
    out.write_vlong(ptrs.freq_ptr - state.freq_ptr)?;
    out.write_vlong(ptrs.prox_ptr - state.prox_ptr)?;
    out.write_vlong(ptrs.skip_len)?;
    out.write_vlong(ptrs.prox_len)?;

    state.term.clear();
    state.term.extend_from_slice(term);
    state.freq_ptr = ptrs.freq_ptr;
    state.prox_ptr = ptrs.prox_ptr;
    Ok(())
}

fn read_record(input: &mut BufFile, state: &mut RecordState, restart: bool) -> Result<(u8, TermPointers)> {
    if restart {
        state.clear();
    }
    let prefix = input.read_vint()? as usize;
    let suffix = input.read_vint()? as usize;
    if prefix > state.term.len() || prefix + suffix > MAX_TERM_LEN {
        return Err(CallunaError::io("corrupt term record"));
    }
    state.term.truncate(prefix);
    let start = state.term.len();
    state.term.resize(start + suffix, 0);
    input.read_exact(&mut state.term[start..])?;

    let field = input.read_vint()?;
    let field =
        u8::try_from(field).map_err(|_| CallunaError::io("corrupt field id in term record"))?;
    let df = input.read_vint()?;
    state.freq_ptr += input.read_vlong()?;
    state.prox_ptr += input.read_vlong()?;
    let skip_len = input.read_vlong()?;
    let prox_len = input.read_vlong()?;
    Ok((
        field,
        TermPointers {
            df,
            freq_ptr: state.freq_ptr,
            skip_len,
            prox_ptr: state.prox_ptr,
            prox_len,
        },
    ))
}

/// Build-time dictionary writer. Terms must arrive in strictly ascending
/// `(field, byte-wise term)` order.
pub struct TermDictionaryWriter {
    tis: BufFile,
    tii: BufFile,
    tis_state: RecordState,
    tii_state: RecordState,
    last_key: Option<(u8, Vec<u8>)>,
    last_index_offset: u64,
    count: u32,
    index_count: u32,
}

impl TermDictionaryWriter {
    pub fn new(tis: Arc<SharedFile>, tii: Arc<SharedFile>) -> Result<Self> {
        let mut tis = BufFile::writer(tis, FILE_BUFFER_LEN)?;
        let mut tii = BufFile::writer(tii, FILE_BUFFER_LEN)?;
        tis.write_uint(0, 4)?;
        tii.write_uint(0, 4)?;
        Ok(TermDictionaryWriter {
            tis,
            tii,
            tis_state: RecordState::default(),
            tii_state: RecordState::default(),
            last_key: None,
            last_index_offset: 0,
            count: 0,
            index_count: 0,
        })
    }

    /// Append one term record.
    pub fn add(&mut self, field: u8, term: &str, ptrs: &TermPointers) -> Result<()> {
        let bytes = term.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_TERM_LEN {
            return Err(CallunaError::invalid_argument(format!(
                "term length {} outside 1..={MAX_TERM_LEN}",
                bytes.len()
            )));
        }
        if let Some((last_field, last_term)) = &self.last_key {
            if (field, bytes) <= (*last_field, last_term.as_slice()) {
                return Err(CallunaError::invalid_argument(format!(
                    "term {field}:{term} not in ascending order"
                )));
            }
        }

        if self.count % INDEX_INTERVAL == 0 {
            let offset = self.tis.tell();
            write_record(&mut self.tii, &mut self.tii_state, field, bytes, ptrs)?;
            self.tii.write_vlong(offset - self.last_index_offset)?;
            self.last_index_offset = offset;
            self.index_count += 1;
            // the matching .tis record restarts the front coding
            self.tis_state.clear();
        }
        write_record(&mut self.tis, &mut self.tis_state, field, bytes, ptrs)?;
        self.count += 1;
        self.last_key = Some((field, bytes.to_vec()));
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Rewrite both count headers and flush.
    pub fn commit(&mut self) -> Result<()> {
        self.tis.seek(0)?;
        self.tis.write_uint(u64::from(self.count), 4)?;
        self.tis.flush()?;
        self.tii.seek(0)?;
        self.tii.write_uint(u64::from(self.index_count), 4)?;
        self.tii.flush()
    }
}

struct IndexEntry {
    field: u8,
    term: Vec<u8>,
    ptrs: TermPointers,
    tis_offset: u64,
}

/// Read-side dictionary: the coarse tier held in memory plus the `.tis`
/// file resolved through a pool-owned linked reader.
pub struct TermDictionary {
    tis: Arc<SharedFile>,
    index: Vec<IndexEntry>,
    num_terms: u32,
}

impl TermDictionary {
    /// Load the coarse index tier into memory.
    pub fn open(tii: &Arc<SharedFile>, tis: &Arc<SharedFile>) -> Result<Self> {
        let mut tis_reader = BufFile::reader(Arc::clone(tis), MIN_IO_BUFFER)?;
        let num_terms = tis_reader.read_uint(4)? as u32;

        let mut tii_reader = BufFile::reader(Arc::clone(tii), FILE_BUFFER_LEN)?;
        let index_count = tii_reader.read_uint(4)? as u32;
        let mut index = Vec::with_capacity(index_count as usize);
        let mut state = RecordState::default();
        let mut tis_offset = 0u64;
        for _ in 0..index_count {
            let (field, ptrs) = read_record(&mut tii_reader, &mut state, false)?;
            tis_offset += tii_reader.read_vlong()?;
            index.push(IndexEntry {
                field,
                term: state.term.clone(),
                ptrs,
                tis_offset,
            });
        }
        debug!(
            "loaded term index: {} of {} terms",
            index.len(),
            num_terms
        );
        Ok(TermDictionary {
            tis: Arc::clone(tis),
            index,
            num_terms,
        })
    }

    pub fn num_terms(&self) -> u32 {
        self.num_terms
    }

    fn locate(&self, field: u8, term: &[u8]) -> std::result::Result<usize, usize> {
        self.index
            .binary_search_by(|e| (e.field, e.term.as_slice()).cmp(&(field, term)))
    }

    /// Resolve a term to its posting pointers. `reader` is the worker's
    /// shared `.tis` reader, rebound for the duration of the scan.
    pub fn get(&self, reader: &mut BufFile, field: u8, term: &str) -> Result<Option<TermPointers>> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let key = term.as_bytes();
        let block = match self.locate(field, key) {
            Ok(i) => return Ok(Some(self.index[i].ptrs)),
            Err(0) => return Ok(None), // sorts before the first term
            Err(pos) => pos - 1,
        };

        let start = block as u32 * INDEX_INTERVAL;
        let limit = INDEX_INTERVAL.min(self.num_terms - start);
        reader.link(&self.tis, self.index[block].tis_offset, 0)?;
        let result = (|| {
            let mut state = RecordState::default();
            for _ in 0..limit {
                let (rec_field, ptrs) = read_record(reader, &mut state, false)?;
                match (rec_field, state.term.as_slice()).cmp(&(field, key)) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => return Ok(Some(ptrs)),
                    std::cmp::Ordering::Greater => return Ok(None),
                }
            }
            Ok(None)
        })();
        reader.unlink();
        result
    }

    /// All records with `lo <= term <= hi` in `field`.
    pub fn get_range(
        &self,
        reader: &mut BufFile,
        field: u8,
        lo: &str,
        hi: &str,
    ) -> Result<Vec<TermRecord>> {
        self.scan(reader, field, lo.as_bytes(), |term| {
            if term < lo.as_bytes() {
                ScanStep::Skip
            } else if term > hi.as_bytes() {
                ScanStep::Stop
            } else {
                ScanStep::Take
            }
        })
    }

    /// All records whose term starts with `prefix` in `field`. Prefixes
    /// shorter than two bytes are rejected as unbounded.
    pub fn get_prefix(
        &self,
        reader: &mut BufFile,
        field: u8,
        prefix: &str,
    ) -> Result<Vec<TermRecord>> {
        let pat = prefix.as_bytes();
        if pat.len() < 2 {
            return Ok(Vec::new());
        }
        self.scan(reader, field, pat, |term| {
            if term.starts_with(pat) {
                ScanStep::Take
            } else {
                let n = term.len().min(pat.len());
                if term[..n] <= pat[..n] {
                    ScanStep::Skip
                } else {
                    ScanStep::Stop
                }
            }
        })
    }

    /// Term strings starting with `prefix` in `field`, for suggesters.
    pub fn get_similar(
        &self,
        reader: &mut BufFile,
        field: u8,
        prefix: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .get_prefix(reader, field, prefix)?
            .into_iter()
            .map(|r| r.term)
            .collect())
    }

    fn scan<F>(
        &self,
        reader: &mut BufFile,
        field: u8,
        start_key: &[u8],
        mut predicate: F,
    ) -> Result<Vec<TermRecord>>
    where
        F: FnMut(&[u8]) -> ScanStep,
    {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }
        let block = match self.locate(field, start_key) {
            Ok(i) => i,
            Err(pos) => pos.saturating_sub(1),
        };
        let start = block as u32 * INDEX_INTERVAL;

        reader.link(&self.tis, self.index[block].tis_offset, 0)?;
        let result = (|| {
            let mut out = Vec::new();
            let mut state = RecordState::default();
            for ordinal in start..self.num_terms {
                let restart = ordinal % INDEX_INTERVAL == 0;
                let (rec_field, ptrs) = read_record(reader, &mut state, restart)?;
                if rec_field < field {
                    continue;
                }
                if rec_field > field {
                    break;
                }
                match predicate(&state.term) {
                    ScanStep::Skip => continue,
                    ScanStep::Stop => break,
                    ScanStep::Take => out.push(TermRecord {
                        field: rec_field,
                        term: String::from_utf8(state.term.clone())
                            .map_err(|_| CallunaError::io("term is not valid UTF-8"))?,
                        ptrs,
                    }),
                }
            }
            Ok(out)
        })();
        reader.unlink();
        result
    }

    /// Sequential cursor over the whole dictionary, used by segment merge.
    pub fn iter(&self) -> Result<TermIter> {
        let mut reader = BufFile::reader(Arc::clone(&self.tis), FILE_BUFFER_LEN)?;
        reader.seek(4)?;
        Ok(TermIter {
            reader,
            state: RecordState::default(),
            ordinal: 0,
            num_terms: self.num_terms,
        })
    }
}

/// Sequential dictionary cursor.
pub struct TermIter {
    reader: BufFile,
    state: RecordState,
    ordinal: u32,
    num_terms: u32,
}

impl TermIter {
    /// Decode the next record, or `None` at the end.
    pub fn advance(&mut self) -> Result<Option<TermRecord>> {
        if self.ordinal == self.num_terms {
            return Ok(None);
        }
        let restart = self.ordinal % INDEX_INTERVAL == 0;
        let (field, ptrs) = read_record(&mut self.reader, &mut self.state, restart)?;
        self.ordinal += 1;
        Ok(Some(TermRecord {
            field,
            term: String::from_utf8(self.state.term.clone())
                .map_err(|_| CallunaError::io("term is not valid UTF-8"))?,
            ptrs,
        }))
    }
}

enum ScanStep {
    Skip,
    Take,
    Stop,
}
