//! Segment build and open: the host-facing call surface.
//!
//! A [`SegmentWriter`] owns a segment's files in build mode. Documents
//! arrive as already-analyzed `(field, token, position)` streams plus
//! stored fields and sort-map values; tokens are accumulated in an
//! in-memory term map and drained in sorted `(field, term)` order through
//! the posting writer and dictionary at commit. A [`SegmentReader`] opens
//! the same files read-only for the evaluator.

use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;

use crate::error::{CallunaError, Result};
use crate::index::deletion::DeletionBitmap;
use crate::index::dictionary::{TermDictionary, TermDictionaryWriter, MAX_TERM_LEN};
use crate::index::posting::{PostingDoc, PostingWriter, TermPointers};
use crate::index::segment::SegmentFiles;
use crate::io::buffer::{BufFile, SharedFile, FILE_BUFFER_LEN};
use crate::memory::MemoryPool;
use crate::store::document::{DocumentReader, DocumentWriter};
use crate::store::sortmap::{SortColumn, SortMapWriter};

/// Build-time options.
#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    /// Store token positions for phrase/proximity queries.
    pub store_positions: bool,
}

impl Default for SegmentWriterConfig {
    fn default() -> Self {
        SegmentWriterConfig {
            store_positions: true,
        }
    }
}

/// Committed-segment description, kept by the host.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub num_docs: u32,
    pub num_terms: u32,
    pub sort_columns: Vec<SortColumn>,
}

/// In-memory accumulation of a segment's postings during indexing.
pub struct TermAccumulator {
    map: AHashMap<(u8, String), Vec<PostingDoc>>,
    store_positions: bool,
}

impl TermAccumulator {
    pub fn new(store_positions: bool) -> Self {
        TermAccumulator {
            map: AHashMap::new(),
            store_positions,
        }
    }

    /// Record one token occurrence. Documents must arrive in ascending
    /// docid order; positions are 1-based and ascending within a document.
    pub fn add(&mut self, doc_id: u32, field: u8, token: &str, position: u32) -> Result<()> {
        if token.is_empty() || token.len() > MAX_TERM_LEN {
            return Err(CallunaError::invalid_argument(format!(
                "token length {} outside 1..={MAX_TERM_LEN}",
                token.len()
            )));
        }
        if self.store_positions && !(1..=u32::from(u16::MAX)).contains(&position) {
            return Err(CallunaError::invalid_argument(format!(
                "token position {position} outside 1..={}",
                u16::MAX
            )));
        }
        let docs = self
            .map
            .entry((field, token.to_string()))
            .or_default();
        match docs.last_mut() {
            Some(last) if last.doc_id == doc_id => {
                last.freq += 1;
                if self.store_positions {
                    last.positions.push(position as u16);
                }
            }
            _ => docs.push(PostingDoc {
                doc_id,
                freq: 1,
                positions: if self.store_positions {
                    vec![position as u16]
                } else {
                    Vec::new()
                },
            }),
        }
        Ok(())
    }

    pub fn term_count(&self) -> usize {
        self.map.len()
    }

    /// All accumulated lists in ascending `(field, term)` order.
    pub fn drain_sorted(&mut self) -> Vec<((u8, String), Vec<PostingDoc>)> {
        let mut terms: Vec<_> = self.map.drain().collect();
        terms.sort_by(|(a, _), (b, _)| (a.0, a.1.as_bytes()).cmp(&(b.0, b.1.as_bytes())));
        terms
    }
}

/// Write-mode view of one segment.
pub struct SegmentWriter {
    postings: PostingWriter,
    dict: TermDictionaryWriter,
    docs: DocumentWriter,
    sortmap: SortMapWriter,
    accumulator: TermAccumulator,
    next_doc: u32,
}

impl SegmentWriter {
    /// Create a segment's files under `dir`.
    pub fn create<P: AsRef<Path>>(
        dir: P,
        name: &str,
        config: SegmentWriterConfig,
    ) -> Result<Self> {
        let files = SegmentFiles::new(dir, name);
        Ok(SegmentWriter {
            postings: PostingWriter::new(
                SharedFile::create(files.frq())?,
                SharedFile::create(files.prx())?,
            )?,
            dict: TermDictionaryWriter::new(
                SharedFile::create(files.tis())?,
                SharedFile::create(files.tii())?,
            )?,
            docs: DocumentWriter::new(
                SharedFile::create(files.fdi())?,
                SharedFile::create(files.fda())?,
            )?,
            sortmap: SortMapWriter::new(SharedFile::create(files.smp())?)?,
            accumulator: TermAccumulator::new(config.store_positions),
            next_doc: 0,
        })
    }

    /// Declare a sort-map column before the first document is added.
    pub fn add_sort_column(&mut self, width: u8) -> Result<usize> {
        self.sortmap.add_column(width)
    }

    /// Append a document: its stored fields, the optional raw document for
    /// snippets, and its analyzed `(field, token, position)` stream.
    /// Returns the assigned docid.
    pub fn add_document(
        &mut self,
        stored_fields: &[&[u8]],
        raw_doc: Option<&str>,
        tokens: &[(u8, &str, u32)],
    ) -> Result<u32> {
        let doc_id = self.docs.write(stored_fields, raw_doc)?;
        for &(field, token, position) in tokens {
            self.accumulator.add(doc_id, field, token, position)?;
        }
        self.next_doc += 1;
        Ok(doc_id)
    }

    /// Append one document's value for a declared sort column.
    pub fn push_sort_value(&mut self, column: usize, value: u64) -> Result<()> {
        self.sortmap.push(column, value)
    }

    /// Append one document's coordinate pair for a declared sort column.
    pub fn push_sort_coord(&mut self, column: usize, lat: u64, long: u64) -> Result<()> {
        self.sortmap.push_coord(column, lat, long)
    }

    /// Buffered bytes held by the build-side staging buffers.
    pub fn usage(&self) -> usize {
        self.docs.usage()
    }

    /// Drain the accumulator through the posting writer and dictionary,
    /// then flush every header.
    pub fn commit(mut self) -> Result<SegmentMeta> {
        let terms = self.accumulator.drain_sorted();
        debug!(
            "committing segment: {} documents, {} terms",
            self.next_doc,
            terms.len()
        );
        for ((field, term), docs) in terms {
            let pointers = self.postings.write_term(&docs)?;
            self.dict.add(field, &term, &pointers)?;
        }
        self.postings.flush()?;
        let num_terms = self.dict.count();
        self.dict.commit()?;
        self.docs.commit()?;
        let sort_columns = self.sortmap.commit(self.next_doc)?;
        Ok(SegmentMeta {
            num_docs: self.next_doc,
            num_terms,
            sort_columns,
        })
    }
}

/// Read-mode view of one segment.
pub struct SegmentReader {
    files: SegmentFiles,
    pub(crate) frq: Arc<SharedFile>,
    pub(crate) prx: Arc<SharedFile>,
    pub(crate) smp: Arc<SharedFile>,
    pub(crate) fdi: Arc<SharedFile>,
    pub(crate) fda: Arc<SharedFile>,
    pub dict: TermDictionary,
    pub docs: DocumentReader,
    num_docs: u32,
}

impl SegmentReader {
    /// Open a committed segment read-only.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self> {
        let files = SegmentFiles::new(dir, name);
        let frq = SharedFile::open(files.frq())?;
        let prx = SharedFile::open(files.prx())?;
        let smp = SharedFile::open(files.smp())?;
        let fdi = SharedFile::open(files.fdi())?;
        let fda = SharedFile::open(files.fda())?;
        let tis = SharedFile::open(files.tis())?;
        let tii = SharedFile::open(files.tii())?;
        let dict = TermDictionary::open(&tii, &tis)?;
        let docs = DocumentReader::open(&fdi, &fda)?;
        let num_docs = docs.num_docs();
        Ok(SegmentReader {
            files,
            frq,
            prx,
            smp,
            fdi,
            fda,
            dict,
            docs,
            num_docs,
        })
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Resolve a term through the dictionary using the pool's shared reader.
    pub fn get(
        &self,
        pool: &mut MemoryPool,
        field: u8,
        term: &str,
    ) -> Result<Option<TermPointers>> {
        self.dict.get(&mut pool.dict_reader, field, term)
    }

    /// Bind the pool's posting cursor to a resolved term.
    pub fn read_postings(
        &self,
        pool: &mut MemoryPool,
        pointers: &TermPointers,
        want_positions: bool,
        zone: Option<(u32, u32)>,
    ) -> Result<u32> {
        pool.posting
            .read(&self.frq, &self.prx, pointers, want_positions, zone)
    }

    /// Bind the pool's sort-map cursor to one column.
    pub fn bind_sort_column(&self, pool: &mut MemoryPool, column: SortColumn) -> Result<()> {
        pool.score_map.bind(&self.smp, column, self.num_docs)
    }

    /// Load the segment's deletion bitmap, if one has been saved.
    pub fn load_deletions(&self) -> Result<Option<DeletionBitmap>> {
        let path = self.files.del();
        if !path.exists() {
            return Ok(None);
        }
        let file = SharedFile::open(path)?;
        let mut reader = BufFile::reader(file, FILE_BUFFER_LEN)?;
        Ok(Some(DeletionBitmap::load(&mut reader)?))
    }

    /// Persist the segment's deletion bitmap.
    pub fn save_deletions(&self, bitmap: &DeletionBitmap) -> Result<()> {
        let file = SharedFile::create(self.files.del())?;
        let mut writer = BufFile::writer(file, FILE_BUFFER_LEN)?;
        bitmap.save(&mut writer)
    }
}
