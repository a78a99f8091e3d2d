//! Compressed per-document field storage and snippet extraction.
//!
//! Two files per segment: `.fdi`, a 4-byte document count followed by one
//! 5-byte offset per docid, and `.fda`, the variable-length records those
//! offsets address. A record is the field count, a `(compressed length,
//! compressed bytes)` pair per field, then the length of a whole-document
//! blob (zero when no raw document was stored) whose plaintext carries the
//! token-boundary positions used for highlighted excerpts.
//!
//! Document insertion order defines docid order within a segment,
//! contiguous from zero.

use std::sync::Arc;

use crate::error::{CallunaError, Result};
use crate::io::buffer::{BufFile, SharedFile, FILE_BUFFER_LEN, MIN_IO_BUFFER};
use crate::io::compress::{
    compress_into, decompress_into, DOCUMENT_COMPRESSION, FIELD_COMPRESSION,
};
use crate::memory::MemoryPool;
use crate::util::word_positions;

/// Width of a `.fdi` offset entry.
const DOC_POINTER_WIDTH: usize = 5;

/// Per-term highlight cap by number of highlight terms (1, 2, many).
fn max_highlights(term_count: usize) -> u32 {
    match term_count {
        1 => 3,
        2 => 2,
        _ => 1,
    }
}

/// Build-time document store writer.
pub struct DocumentWriter {
    fdi: BufFile,
    fda: BufFile,
    doc_buf: BufFile,
    field_buf: BufFile,
    blob_buf: BufFile,
    num_docs: u32,
}

impl DocumentWriter {
    pub fn new(fdi: Arc<SharedFile>, fda: Arc<SharedFile>) -> Result<Self> {
        let mut fdi = BufFile::writer(fdi, FILE_BUFFER_LEN)?;
        fdi.write_uint(0, 4)?;
        Ok(DocumentWriter {
            fdi,
            fda: BufFile::writer(fda, FILE_BUFFER_LEN)?,
            doc_buf: BufFile::memory(FILE_BUFFER_LEN)?,
            field_buf: BufFile::memory(FILE_BUFFER_LEN)?,
            blob_buf: BufFile::memory(FILE_BUFFER_LEN)?,
            num_docs: 0,
        })
    }

    /// Append one document: each field compressed independently, then the
    /// optional raw document with its token-boundary positions for snippet
    /// extraction.
    pub fn write(&mut self, fields: &[&[u8]], raw_doc: Option<&str>) -> Result<u32> {
        self.fdi.write_uint(self.fda.tell(), DOC_POINTER_WIDTH)?;

        self.fda.write_vint(fields.len() as u32)?;
        for field in fields {
            self.field_buf.reset();
            compress_into(field, &mut self.field_buf, FIELD_COMPRESSION)?;
            self.fda.write_vint(self.field_buf.len() as u32)?;
            self.fda.write_all(self.field_buf.data())?;
        }

        match raw_doc {
            Some(doc) if !doc.is_empty() => {
                let positions = word_positions(doc);
                self.doc_buf.reset();
                self.blob_buf.reset();

                let mut last = 0u32;
                for &pos in &positions {
                    self.blob_buf.write_vint(pos - last)?;
                    last = pos;
                }
                self.doc_buf.write_vint(positions.len() as u32)?;
                self.doc_buf.write_vint(self.blob_buf.len() as u32)?;
                self.doc_buf.write_all(self.blob_buf.data())?;
                self.doc_buf.write_all(doc.as_bytes())?;

                self.blob_buf.reset();
                compress_into(self.doc_buf.data(), &mut self.blob_buf, DOCUMENT_COMPRESSION)?;
                self.fda.write_vint(self.blob_buf.len() as u32)?;
                self.fda.write_all(self.blob_buf.data())?;
            }
            _ => {
                self.fda.write_vint(0)?;
            }
        }

        self.num_docs += 1;
        Ok(self.num_docs - 1)
    }

    /// Byte-copy one source document verbatim, skipping deleted docids.
    /// Returns whether the document was kept. The record is only addressed,
    /// never decompressed.
    pub fn merge(
        &mut self,
        src: &mut DocumentSource,
        doc_id: u32,
        deleted: bool,
    ) -> Result<bool> {
        if deleted {
            return Ok(false);
        }
        self.fdi.write_uint(self.fda.tell(), DOC_POINTER_WIDTH)?;

        src.fdi
            .seek(4 + u64::from(doc_id) * DOC_POINTER_WIDTH as u64)?;
        let offset = src.fdi.read_uint(DOC_POINTER_WIDTH)?;
        src.fda.seek(offset)?;

        let field_count = src.fda.read_vint()?;
        self.fda.write_vint(field_count)?;
        for _ in 0..field_count {
            let len = src.fda.read_vint()?;
            self.fda.write_vint(len)?;
            src.fda.copy_to(&mut self.fda, u64::from(len))?;
        }
        let blob_len = src.fda.read_vint()?;
        self.fda.write_vint(blob_len)?;
        if blob_len > 0 {
            src.fda.copy_to(&mut self.fda, u64::from(blob_len))?;
        }

        self.num_docs += 1;
        Ok(true)
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Staging-buffer bytes, for the pool usage ceiling.
    pub fn usage(&self) -> usize {
        self.doc_buf.capacity_bytes()
            + self.field_buf.capacity_bytes()
            + self.blob_buf.capacity_bytes()
    }

    /// Rewrite the document count and flush both files.
    pub fn commit(&mut self) -> Result<()> {
        self.fda.flush()?;
        self.fdi.seek(0)?;
        self.fdi.write_uint(u64::from(self.num_docs), 4)?;
        self.fdi.flush()
    }
}

/// A source segment's document files during merge.
pub struct DocumentSource {
    pub fdi: BufFile,
    pub fda: BufFile,
}

impl DocumentSource {
    pub fn open(fdi: &Arc<SharedFile>, fda: &Arc<SharedFile>) -> Result<Self> {
        Ok(DocumentSource {
            fdi: BufFile::reader(Arc::clone(fdi), MIN_IO_BUFFER)?,
            fda: BufFile::reader(Arc::clone(fda), FILE_BUFFER_LEN)?,
        })
    }
}

/// Read-side document store.
pub struct DocumentReader {
    fdi: Arc<SharedFile>,
    fda: Arc<SharedFile>,
    num_docs: u32,
}

impl DocumentReader {
    pub fn open(fdi: &Arc<SharedFile>, fda: &Arc<SharedFile>) -> Result<Self> {
        let mut header = BufFile::reader(Arc::clone(fdi), MIN_IO_BUFFER)?;
        let num_docs = header.read_uint(4)? as u32;
        Ok(DocumentReader {
            fdi: Arc::clone(fdi),
            fda: Arc::clone(fda),
            num_docs,
        })
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Decompress one stored field of a document.
    pub fn read(&self, pool: &mut MemoryPool, doc_id: u32, field: usize) -> Result<Vec<u8>> {
        self.load(pool, doc_id, field)?;
        Ok(pool.scratch0.data().to_vec())
    }

    /// Decompress one stored field and build a highlighted excerpt of about
    /// `budget` tokens from the raw document. With no matching term the
    /// excerpt falls back to a head truncation; with no stored raw document
    /// it is empty.
    pub fn read_excerpt(
        &self,
        pool: &mut MemoryPool,
        doc_id: u32,
        field: usize,
        budget: u32,
        highlight_terms: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        self.load(pool, doc_id, field)?;
        let field_bytes = pool.scratch0.data().to_vec();
        if pool.scratch1.is_empty() || budget == 0 {
            return Ok((field_bytes, String::new()));
        }
        let excerpt = make_excerpt(pool.scratch1.data(), budget, highlight_terms)?;
        Ok((field_bytes, excerpt))
    }

    /// Read a record into the pool: the chosen field decompressed into
    /// `scratch0`, the document blob (when stored) into `scratch1`.
    fn load(&self, pool: &mut MemoryPool, doc_id: u32, field: usize) -> Result<()> {
        if doc_id >= self.num_docs {
            return Err(CallunaError::invalid_argument(format!(
                "docid {doc_id} out of range for store of {} documents",
                self.num_docs
            )));
        }
        pool.doc_index.link(
            &self.fdi,
            4 + u64::from(doc_id) * DOC_POINTER_WIDTH as u64,
            DOC_POINTER_WIDTH,
        )?;
        let result = self.load_linked(pool, field);
        pool.doc_data.unlink();
        pool.doc_index.unlink();
        result
    }

    fn load_linked(&self, pool: &mut MemoryPool, field: usize) -> Result<()> {
        let offset = pool.doc_index.read_uint(DOC_POINTER_WIDTH)?;
        pool.doc_data.link(&self.fda, offset, 0)?;

        let field_count = pool.doc_data.read_vint()? as usize;
        if field >= field_count {
            return Err(CallunaError::invalid_argument(format!(
                "field {field} out of range for record of {field_count} fields"
            )));
        }
        pool.scratch0.reset();
        pool.scratch1.reset();
        for i in 0..field_count {
            let len = pool.doc_data.read_vint()?;
            if i == field {
                pool.scratch2.reset();
                pool.scratch2.extend(len as usize)?;
                pool.doc_data.copy_to(&mut pool.scratch2, u64::from(len))?;
                decompress_into(pool.scratch2.data(), &mut pool.scratch0)?;
            } else {
                let skip_to = pool.doc_data.tell() + u64::from(len);
                pool.doc_data.seek(skip_to)?;
            }
        }
        let blob_len = pool.doc_data.read_vint()?;
        if blob_len > 0 {
            pool.scratch2.reset();
            pool.scratch2.extend(blob_len as usize)?;
            pool.doc_data.copy_to(&mut pool.scratch2, u64::from(blob_len))?;
            decompress_into(pool.scratch2.data(), &mut pool.scratch1)?;
        }
        Ok(())
    }
}

/// Build a bounded excerpt from a decompressed document blob.
fn make_excerpt(blob: &[u8], budget: u32, highlight_terms: &[&str]) -> Result<String> {
    let mut cursor = BufFile::memory(MIN_IO_BUFFER)?;
    cursor.write_all(blob)?;
    cursor.seek(0)?;

    let pos_count = cursor.read_vint()? as usize;
    if pos_count == 0 {
        return Ok(String::new());
    }
    let _pos_bytes = cursor.read_vint()?;

    // leading implicit position 0, then the stored gaps
    let mut positions = Vec::with_capacity(pos_count + 1);
    positions.push(0u32);
    let mut last = 0u32;
    for _ in 0..pos_count {
        last += cursor.read_vint()?;
        positions.push(last);
    }
    let doc_start = cursor.tell() as usize;
    let text = std::str::from_utf8(&blob[doc_start..])
        .map_err(|_| CallunaError::io("stored document is not valid UTF-8"))?;

    let terms: Vec<String> = highlight_terms
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect();

    let mut out = String::new();
    if !terms.is_empty() {
        let cap = max_highlights(terms.len());
        let window = {
            let w = budget / (terms.len() as u32) / 2;
            if w < 3 { 5 } else { w }
        } as usize;
        let mut found = vec![0u32; terms.len()];
        let mut emitted = 0usize;
        let mut cooldown = 0usize;

        for i in 0..pos_count {
            let start = positions[i] as usize;
            let end = positions[i + 1] as usize;
            if start >= text.len() {
                break;
            }
            let token = &text[start..end.min(text.len())];
            let last_token = i + 1 == pos_count;

            let mut matched = None;
            for (t, term) in terms.iter().enumerate() {
                if token.len() < term.len() {
                    continue;
                }
                if !token.as_bytes()[..term.len()].eq_ignore_ascii_case(term.as_bytes()) {
                    continue;
                }
                // "roof" must not highlight inside "roofs"
                let tail = &token[term.len()..];
                if !last_token
                    && tail
                        .chars()
                        .next()
                        .map(crate::util::is_word_char)
                        .unwrap_or(false)
                {
                    continue;
                }
                matched = Some(t);
                break;
            }

            if let Some(t) = matched {
                if found[t] >= cap && cooldown < window {
                    cooldown = 0;
                    continue;
                }
                found[t] += 1;
                if cooldown == 0 {
                    // open a fresh window, backing up `window` tokens
                    let from = i.saturating_sub(window);
                    if from > 0 {
                        out.push_str("...");
                    }
                    out.push_str(&text[positions[from] as usize..start]);
                    emitted += i - from;
                }
                let term_len = terms[t].len();
                out.push_str("<b>");
                out.push_str(&token[..term_len.min(token.len())]);
                out.push_str("</b>");
                out.push_str(&text[(start + term_len.min(token.len())).min(text.len())
                    ..end.min(text.len())]);
                emitted += 1;
                cooldown = window + 1;
            } else if cooldown > 0 {
                out.push_str(&text[start..end.min(text.len())]);
                emitted += 1;
            }

            cooldown = cooldown.saturating_sub(1);
            if emitted > budget as usize {
                break;
            }
        }
    }

    if out.is_empty() {
        // head-truncated fallback
        let cut = positions
            .get(budget as usize + 1)
            .map(|&p| (p as usize).saturating_sub(1))
            .unwrap_or(text.len())
            .min(text.len());
        out.push_str(&text[..cut]);
    }
    Ok(out)
}
