//! Per-term posting list encoding, skip-accelerated decoding and merge.
//!
//! A term's `.frq` window holds its skip chain followed by the doc/freq
//! delta stream; the `.prx` window holds gap-encoded positions. Docids are
//! strictly increasing and delta-coded as `(doc - last) << 1 | (freq == 1)`,
//! with an explicit VInt frequency only when the low bit is clear. A skip
//! entry `(doc delta, freq byte delta, prox byte delta)` is emitted after
//! every [`SKIP_INTERVAL`]th posting; the final partial interval is scanned
//! linearly.

use std::sync::Arc;

use log::trace;

use crate::error::{CallunaError, Result};
use crate::index::segment::SegmentMergeInfo;
use crate::io::buffer::{BufFile, SharedFile, FILE_BUFFER_LEN};

/// Postings per skip entry.
pub const SKIP_INTERVAL: u32 = 16;

/// One document's postings for a term, as handed to the writer.
#[derive(Clone, Debug, PartialEq)]
pub struct PostingDoc {
    pub doc_id: u32,
    pub freq: u32,
    /// Strictly increasing 1-based token positions; empty when the term's
    /// field stores no positions.
    pub positions: Vec<u16>,
}

/// Where a term's posting data lives, as recorded in the term dictionary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TermPointers {
    pub df: u32,
    pub freq_ptr: u64,
    pub skip_len: u64,
    pub prox_ptr: u64,
    pub prox_len: u64,
}

/// Outcome of a skip-accelerated seek.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seek {
    /// The target docid is present and is now the current posting.
    Found,
    /// The target falls between postings; the cursor stopped at the first
    /// docid past it.
    NotPresent,
    /// The list has no docid at or beyond the target.
    Exhausted,
}

/// Append-only writer for a segment's `.frq`/`.prx` pair.
///
/// Terms are written one at a time: [`begin_term`](Self::begin_term), one
/// [`push`](Self::push) per document in ascending docid order, then
/// [`end_term`](Self::end_term) which emits the staged streams and returns
/// the pointers for the dictionary.
pub struct PostingWriter {
    frq: BufFile,
    prx: BufFile,
    freq_buf: BufFile,
    prox_buf: BufFile,
    skip_buf: BufFile,
    doc_count: u32,
    last_doc: u32,
    skip_doc: u32,
    skip_freq: u64,
    skip_prox: u64,
    has_positions: bool,
}

impl PostingWriter {
    pub fn new(frq: Arc<SharedFile>, prx: Arc<SharedFile>) -> Result<Self> {
        Ok(PostingWriter {
            frq: BufFile::writer(frq, FILE_BUFFER_LEN)?,
            prx: BufFile::writer(prx, FILE_BUFFER_LEN)?,
            freq_buf: BufFile::memory(FILE_BUFFER_LEN)?,
            prox_buf: BufFile::memory(FILE_BUFFER_LEN)?,
            skip_buf: BufFile::memory(256)?,
            doc_count: 0,
            last_doc: 0,
            skip_doc: 0,
            skip_freq: 0,
            skip_prox: 0,
            has_positions: false,
        })
    }

    /// Start staging a new term.
    pub fn begin_term(&mut self) {
        self.freq_buf.reset();
        self.prox_buf.reset();
        self.skip_buf.reset();
        self.doc_count = 0;
        self.last_doc = 0;
        self.skip_doc = 0;
        self.skip_freq = 0;
        self.skip_prox = 0;
        self.has_positions = false;
    }

    /// Stage one document. Docids must be strictly increasing within the
    /// term; positions, when present, must be strictly increasing and start
    /// at 1, with exactly `freq` entries.
    pub fn push(&mut self, doc_id: u32, freq: u32, positions: &[u16]) -> Result<()> {
        if self.doc_count > 0 && doc_id <= self.last_doc {
            return Err(CallunaError::invalid_argument(format!(
                "posting docid {doc_id} not greater than {}",
                self.last_doc
            )));
        }
        if freq == 0 {
            return Err(CallunaError::invalid_argument("posting frequency is zero"));
        }
        if !positions.is_empty() && positions.len() != freq as usize {
            return Err(CallunaError::invalid_argument(
                "position count does not match frequency",
            ));
        }
        if self.doc_count > 0 && self.has_positions != !positions.is_empty() {
            return Err(CallunaError::invalid_argument(
                "positions must be stored for every document of a term or none",
            ));
        }
        self.has_positions = !positions.is_empty();

        let delta = (doc_id - if self.doc_count == 0 { 0 } else { self.last_doc }) << 1;
        if freq == 1 {
            self.freq_buf.write_vint(delta | 1)?;
        } else {
            self.freq_buf.write_vint(delta)?;
            self.freq_buf.write_vint(freq)?;
        }
        let mut last_pos = 0u32;
        for &pos in positions {
            let pos = u32::from(pos);
            if pos <= last_pos {
                return Err(CallunaError::invalid_argument(
                    "positions not strictly increasing",
                ));
            }
            self.prox_buf.write_vint(pos - last_pos - 1)?;
            last_pos = pos;
        }

        self.last_doc = doc_id;
        self.doc_count += 1;
        if self.doc_count % SKIP_INTERVAL == 0 {
            self.skip_buf.write_vint(doc_id - self.skip_doc)?;
            self.skip_buf
                .write_vlong(self.freq_buf.tell() - self.skip_freq)?;
            self.skip_buf
                .write_vlong(self.prox_buf.tell() - self.skip_prox)?;
            self.skip_doc = doc_id;
            self.skip_freq = self.freq_buf.tell();
            self.skip_prox = self.prox_buf.tell();
        }
        Ok(())
    }

    /// Emit the staged term and return its dictionary pointers.
    pub fn end_term(&mut self) -> Result<TermPointers> {
        let pointers = TermPointers {
            df: self.doc_count,
            freq_ptr: self.frq.tell(),
            skip_len: self.skip_buf.len() as u64,
            prox_ptr: self.prx.tell(),
            prox_len: self.prox_buf.len() as u64,
        };
        self.frq.write_all(self.skip_buf.data())?;
        self.frq.write_all(self.freq_buf.data())?;
        self.prx.write_all(self.prox_buf.data())?;
        Ok(pointers)
    }

    /// Write a whole ordered posting list in one call.
    pub fn write_term(&mut self, docs: &[PostingDoc]) -> Result<TermPointers> {
        self.begin_term();
        for doc in docs {
            self.push(doc.doc_id, doc.freq, &doc.positions)?;
        }
        self.end_term()
    }

    /// Flush both streams to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.frq.flush()?;
        self.prx.flush()
    }
}

struct SkipState {
    buf: BufFile,
    remaining: u32,
    entries_total: u32,
    doc: u32,
    freq_pos: u64,
    prox_pos: u64,
    next_doc: u32,
    next_freq: u64,
    next_prox: u64,
    /// Absolute file offset of the doc/freq stream.
    freq_base: u64,
    prox_base: u64,
    /// Set once a seek has fallen past the end of the chain.
    tail: bool,
}

/// Decoding cursor over one bound posting list. One lives in each worker's
/// memory pool; [`read`](Self::read) rebinds its shared readers per term.
pub struct PostingCursor {
    pub frq: BufFile,
    pub prx: BufFile,
    skip: SkipState,
    /// Whether a list is currently bound.
    pub active: bool,
    /// Documents available to the evaluator (zone-limited).
    pub df: u32,
    /// Full document frequency from the dictionary.
    pub term_df: u32,
    pub has_prox: bool,
    pub weight: f32,
    pub idf: f32,
    /// Current posting after [`advance`](Self::advance).
    pub doc_id: u32,
    pub freq: u16,
    pub positions: Vec<u16>,
    /// Number of postings decoded since the bind.
    pub decoded: u32,
    last_doc: u32,
    remaining_docs: u32,
}

impl PostingCursor {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(PostingCursor {
            frq: BufFile::unbound_reader(capacity)?,
            prx: BufFile::unbound_reader(capacity)?,
            skip: SkipState {
                buf: BufFile::memory(256)?,
                remaining: 0,
                entries_total: 0,
                doc: 0,
                freq_pos: 0,
                prox_pos: 0,
                next_doc: 0,
                next_freq: 0,
                next_prox: 0,
                freq_base: 0,
                prox_base: 0,
                tail: false,
            },
            active: false,
            df: 0,
            term_df: 0,
            has_prox: false,
            weight: 1.0,
            idf: 0.0,
            doc_id: 0,
            freq: 0,
            positions: Vec::new(),
            decoded: 0,
            last_doc: 0,
            remaining_docs: 0,
        })
    }

    /// Bind the cursor to a term's posting windows. `zone` optionally
    /// restricts decoding to `(first doc ordinal, doc count)`.
    pub fn read(
        &mut self,
        frq_file: &Arc<SharedFile>,
        prx_file: &Arc<SharedFile>,
        pointers: &TermPointers,
        want_positions: bool,
        zone: Option<(u32, u32)>,
    ) -> Result<u32> {
        self.release();
        self.frq.link(frq_file, pointers.freq_ptr, 0)?;
        self.skip.buf.reset();
        if pointers.skip_len > 0 {
            self.frq.copy_to(&mut self.skip.buf, pointers.skip_len)?;
            self.skip.buf.seek(0)?;
        }
        self.skip.remaining = pointers.df / SKIP_INTERVAL;
        self.skip.entries_total = self.skip.remaining;
        self.skip.doc = 0;
        self.skip.freq_pos = 0;
        self.skip.prox_pos = 0;
        self.skip.next_doc = 0;
        self.skip.next_freq = 0;
        self.skip.next_prox = 0;
        self.skip.freq_base = pointers.freq_ptr + pointers.skip_len;
        self.skip.prox_base = pointers.prox_ptr;
        self.skip.tail = false;

        self.has_prox = want_positions && pointers.prox_len > 0;
        if self.has_prox {
            self.prx.link(prx_file, pointers.prox_ptr, 0)?;
        }
        self.term_df = pointers.df;
        self.df = pointers.df;
        self.last_doc = 0;
        self.doc_id = 0;
        self.freq = 0;
        self.decoded = 0;
        self.remaining_docs = pointers.df;
        self.active = true;

        if let Some((offset, len)) = zone {
            let offset = offset.min(pointers.df);
            for _ in 0..offset {
                self.advance()?;
            }
            self.decoded = 0;
            self.df = len.min(pointers.df - offset);
        }
        Ok(self.df)
    }

    /// Decode the next posting into `doc_id` / `freq` / `positions`.
    pub fn advance(&mut self) -> Result<()> {
        if self.remaining_docs == 0 {
            return Err(CallunaError::io("posting stream exhausted"));
        }
        let delta = self.frq.read_vint()?;
        let freq = if delta & 1 == 1 {
            1
        } else {
            self.frq.read_vint()?
        };
        self.last_doc += delta >> 1;
        self.doc_id = self.last_doc;
        self.freq = freq.min(u32::from(u16::MAX)) as u16;
        if self.has_prox {
            self.positions.clear();
            let mut last = 0u32;
            for _ in 0..freq {
                let gap = self.prx.read_vint()?;
                last += gap + 1;
                self.positions.push(last.min(u32::from(u16::MAX)) as u16);
            }
        }
        self.decoded += 1;
        self.remaining_docs -= 1;
        Ok(())
    }

    /// Seek to `target`: walk the skip chain while the target lies beyond
    /// the next skip point, then advance linearly inside the located
    /// interval. Targets must not decrease between calls on one binding.
    pub fn search(&mut self, target: u32) -> Result<Seek> {
        if self.decoded > 0 && self.doc_id == target {
            return Ok(Seek::Found);
        }
        if target < self.skip.doc || (self.decoded > 0 && target < self.doc_id) {
            return Ok(Seek::NotPresent);
        }

        if target > self.skip.next_doc && !self.skip.tail {
            let mut bracketed = false;
            while self.skip.remaining > 0 {
                self.skip.doc = self.skip.next_doc;
                self.skip.freq_pos = self.skip.next_freq;
                self.skip.prox_pos = self.skip.next_prox;
                let doc_delta = self.skip.buf.read_vint()?;
                let freq_delta = self.skip.buf.read_vlong()?;
                let prox_delta = self.skip.buf.read_vlong()?;
                self.skip.next_doc = self.skip.doc + doc_delta;
                self.skip.next_freq = self.skip.freq_pos + freq_delta;
                self.skip.next_prox = self.skip.prox_pos + prox_delta;
                self.skip.remaining -= 1;

                if target >= self.skip.doc && target <= self.skip.next_doc {
                    trace!(
                        "skip seek to interval {} for docid {target}",
                        self.skip.entries_total - self.skip.remaining
                    );
                    let consumed = self.skip.entries_total - self.skip.remaining;
                    self.reposition(self.skip.doc, self.skip.freq_pos, self.skip.prox_pos)?;
                    self.remaining_docs = self.term_df - (consumed - 1) * SKIP_INTERVAL;
                    bracketed = true;
                    break;
                }
            }
            if !bracketed {
                self.reposition(self.skip.next_doc, self.skip.next_freq, self.skip.next_prox)?;
                self.remaining_docs = self.term_df % SKIP_INTERVAL;
                self.skip.tail = true;
            }
        }

        let proceed = SKIP_INTERVAL + self.df % SKIP_INTERVAL;
        for _ in 0..proceed {
            if self.remaining_docs == 0 {
                return Ok(Seek::Exhausted);
            }
            self.advance()?;
            if self.doc_id == target {
                return Ok(Seek::Found);
            }
            if self.doc_id > target {
                return Ok(Seek::NotPresent);
            }
        }
        Ok(Seek::NotPresent)
    }

    fn reposition(&mut self, doc: u32, freq_pos: u64, prox_pos: u64) -> Result<()> {
        self.last_doc = doc;
        self.frq.seek(self.skip.freq_base + freq_pos)?;
        if self.has_prox {
            self.prx.seek(self.skip.prox_base + prox_pos)?;
        }
        Ok(())
    }

    /// Unbind the cursor and restore the shared readers.
    pub fn release(&mut self) {
        if self.active {
            self.frq.unlink();
            if self.has_prox {
                self.prx.unlink();
            }
            self.active = false;
        }
        self.weight = 1.0;
        self.idf = 0.0;
    }

    /// Bytes reserved by the cursor's buffers.
    pub fn capacity_bytes(&self) -> usize {
        self.frq.capacity_bytes()
            + self.prx.capacity_bytes()
            + self.skip.buf.capacity_bytes()
            + self.positions.capacity() * std::mem::size_of::<u16>()
    }

    /// Release surplus buffer capacity.
    pub fn shrink(&mut self) {
        self.frq.shrink();
        self.prx.shrink();
        self.skip.buf.shrink();
        self.positions.shrink_to(64);
    }
}

/// Re-emit the bound posting list into `writer`, dropping deleted documents
/// and renumbering survivors through the segment's doc map. The caller
/// brackets one destination term with `begin_term`/`end_term` across all
/// source segments. Returns the number of surviving postings.
pub fn merge_postings(
    cursor: &mut PostingCursor,
    writer: &mut PostingWriter,
    smi: &SegmentMergeInfo,
) -> Result<u32> {
    let mut kept = 0;
    for _ in 0..cursor.df {
        cursor.advance()?;
        let Some(new_doc) = smi.remap(cursor.doc_id) else {
            continue;
        };
        if cursor.has_prox {
            writer.push(new_doc, u32::from(cursor.freq), &cursor.positions)?;
        } else {
            writer.push(new_doc, u32::from(cursor.freq), &[])?;
        }
        kept += 1;
    }
    Ok(kept)
}
