//! Multi-segment merge.
//!
//! N source segments collapse into one destination: a k-way walk over the
//! source dictionaries merges equal `(field, term)` posting lists with
//! docid renumbering through each segment's doc map, while document
//! records are byte-copied and sort-map columns re-packed for surviving
//! docids. Deleted documents simply vanish; each segment's survivors keep
//! their relative order starting at the segment's base docid.

use std::path::Path;

use log::debug;

use crate::error::{CallunaError, Result};
use crate::index::builder::SegmentReader;
use crate::index::deletion::DeletionBitmap;
use crate::index::dictionary::{TermDictionaryWriter, TermRecord};
use crate::index::posting::{merge_postings, PostingCursor, PostingWriter};
use crate::index::segment::{SegmentFiles, SegmentMergeInfo};
use crate::io::buffer::{SharedFile, FILE_BUFFER_LEN};
use crate::store::document::{DocumentSource, DocumentWriter};
use crate::store::sortmap::{SortColumn, SortMapCursor, SortMapWriter};

/// One source segment of a merge.
pub struct MergeSource {
    pub reader: SegmentReader,
    pub bitmap: Option<DeletionBitmap>,
    /// The segment's sort-map columns, in declaration order. Every source
    /// must declare the same columns.
    pub sort_columns: Vec<SortColumn>,
}

/// What a merge produced.
#[derive(Debug, Clone)]
pub struct MergeStats {
    pub num_docs: u32,
    pub num_terms: u32,
    pub sort_columns: Vec<SortColumn>,
}

/// Merge `sources` into a new segment `name` under `dir`.
pub fn merge_segments<P: AsRef<Path>>(
    sources: &[MergeSource],
    dir: P,
    name: &str,
) -> Result<MergeStats> {
    if sources.is_empty() {
        return Err(CallunaError::invalid_argument("no segments to merge"));
    }
    let column_layout: Vec<u8> = sources[0].sort_columns.iter().map(|c| c.width).collect();
    for source in sources {
        let widths: Vec<u8> = source.sort_columns.iter().map(|c| c.width).collect();
        if widths != column_layout {
            return Err(CallunaError::invalid_argument(
                "source segments declare different sort columns",
            ));
        }
    }

    // assign each segment's base docid from the survivors before it
    let mut infos = Vec::with_capacity(sources.len());
    let mut base = 0u32;
    for source in sources {
        let info = SegmentMergeInfo::new(base, source.reader.num_docs(), source.bitmap.clone());
        base += info.survivors();
        infos.push(info);
    }
    let total_docs = base;

    let files = SegmentFiles::new(&dir, name);
    let mut postings = PostingWriter::new(
        SharedFile::create(files.frq())?,
        SharedFile::create(files.prx())?,
    )?;
    let mut dict = TermDictionaryWriter::new(
        SharedFile::create(files.tis())?,
        SharedFile::create(files.tii())?,
    )?;
    let mut docs = DocumentWriter::new(
        SharedFile::create(files.fdi())?,
        SharedFile::create(files.fda())?,
    )?;
    let mut sortmap = SortMapWriter::new(SharedFile::create(files.smp())?)?;

    merge_terms(sources, &infos, &mut postings, &mut dict)?;

    for (source, info) in sources.iter().zip(&infos) {
        let mut doc_source = DocumentSource::open(&source.reader.fdi, &source.reader.fda)?;
        for doc_id in 0..info.num_docs {
            docs.merge(&mut doc_source, doc_id, info.is_deleted(doc_id))?;
        }
    }

    for width in &column_layout {
        sortmap.add_column(*width)?;
    }
    let mut map_cursor = SortMapCursor::new(FILE_BUFFER_LEN)?;
    for (column_index, _) in column_layout.iter().enumerate() {
        for (source, info) in sources.iter().zip(&infos) {
            map_cursor.bind(
                &source.reader.smp,
                source.sort_columns[column_index],
                info.num_docs,
            )?;
            sortmap.merge_column(column_index, &mut map_cursor, info)?;
            map_cursor.unbind();
        }
    }

    postings.flush()?;
    let num_terms = dict.count();
    dict.commit()?;
    docs.commit()?;
    let sort_columns = sortmap.commit(total_docs)?;
    debug!("merged {} segments into {name}: {total_docs} documents, {num_terms} terms", sources.len());
    Ok(MergeStats {
        num_docs: total_docs,
        num_terms,
        sort_columns,
    })
}

/// K-way walk over the source dictionaries, appending merged posting lists
/// and dictionary records to the destination.
fn merge_terms(
    sources: &[MergeSource],
    infos: &[SegmentMergeInfo],
    postings: &mut PostingWriter,
    dict: &mut TermDictionaryWriter,
) -> Result<()> {
    let mut iters = Vec::with_capacity(sources.len());
    let mut heads: Vec<Option<TermRecord>> = Vec::with_capacity(sources.len());
    for source in sources {
        let mut iter = source.reader.dict.iter()?;
        heads.push(iter.advance()?);
        iters.push(iter);
    }
    let mut cursor = PostingCursor::new(FILE_BUFFER_LEN)?;

    loop {
        let Some(min_key) = heads
            .iter()
            .flatten()
            .map(|r| (r.field, r.term.clone()))
            .min_by(|a, b| (a.0, a.1.as_bytes()).cmp(&(b.0, b.1.as_bytes())))
        else {
            break;
        };

        postings.begin_term();
        let mut kept = 0u32;
        for (index, head) in heads.iter_mut().enumerate() {
            let Some(record) =
                head.take_if(|r| (r.field, r.term.as_str()) == (min_key.0, min_key.1.as_str()))
            else {
                continue;
            };
            let want_positions = record.ptrs.prox_len > 0;
            cursor.read(
                &sources[index].reader.frq,
                &sources[index].reader.prx,
                &record.ptrs,
                want_positions,
                None,
            )?;
            kept += merge_postings(&mut cursor, postings, &infos[index])?;
            cursor.release();
            *head = iters[index].advance()?;
        }
        let pointers = postings.end_term()?;
        if kept > 0 {
            dict.add(min_key.0, &min_key.1, &pointers)?;
        }
    }
    Ok(())
}
