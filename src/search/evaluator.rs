//! The set-algebra query evaluator.
//!
//! An [`Evaluator`] borrows one worker's [`MemoryPool`] and executes a
//! sequence of operator calls over it: `set` binds and materializes a leaf
//! term's postings, `intersect`/`union`/`trim` merge the previous result set
//! against the bound posting (or a popped bank), `between`/`bit`/`distance`
//! filter or seed a result set from the dense sort map, and `sort`/`fetch`
//! produce the final page. A bank stack of up to [`MAX_BANKS`] saved result
//! sets supports nested boolean sub-expressions.
//!
//! Any I/O error during decode aborts the operator with `Err`; no partial
//! result set is exposed.

use std::cmp::Ordering;
use std::sync::LazyLock;

use crate::error::{CallunaError, Result};
use crate::index::builder::SegmentReader;
use crate::index::deletion::DeletionBitmap;
use crate::index::posting::{PostingCursor, Seek, TermPointers, SKIP_INTERVAL};
use crate::memory::MemoryPool;
use crate::search::hits::{Extra, ExtraKind, Hit, HitList, Score};
use crate::store::sortmap::{decode_degrees, SortColumn, SortMapCursor};
use crate::util::{earth_distance_m, heapsort_partial};

/// Maximum depth of the saved-bank stack.
pub const MAX_BANKS: usize = 10;

/// Entries in the per-term score cache.
pub const SCORE_CACHE_COUNT: usize = 32;

/// Meters per degree of latitude, for the geo bounding box.
const LAT_DEGREE_M: f64 = 111_234.5;

/// Meters per degree of longitude, for the geo bounding box.
const LONG_DEGREE_M: f64 = 85_317.0;

/// Norm byte to multiplier table.
static NORM_TABLE: LazyLock<[f32; 256]> = LazyLock::new(|| {
    let mut table = [0.0f32; 256];
    for (i, v) in table.iter_mut().enumerate() {
        *v = i as f32 / 2550.0;
    }
    table
});

/// How a sort-map filter combines with the existing result set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOp {
    Intersect,
    Union,
    Trim,
}

/// Bitmask filter mode: require all mask bits, any mask bit, or not all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitMode {
    All,
    Any,
    None,
}

/// Requested output order; `Descending` puts the highest value first in the
/// fetched page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One fetched result row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HitDoc {
    pub segment: u32,
    pub doc_id: u32,
    pub extra: Extra,
    pub score: Score,
}

/// Which operand supplies sort-key/extra payloads for merged hits.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Neither,
    Iter,
    Source,
}

/// A decoded document from the pending operand.
#[derive(Clone, Copy)]
struct SrcDoc {
    doc_id: u32,
    freq: u16,
    score: Score,
    extra: Extra,
}

/// Scoring context for one operator invocation.
struct Scorer<'m> {
    n: u32,
    cache: [f32; SCORE_CACHE_COUNT],
    weight: f32,
    idf: f32,
    map: &'m mut SortMapCursor,
}

impl Scorer<'_> {
    fn score(&mut self, doc_id: u32, freq: u16) -> Result<f32> {
        let norm = if self.map.active && self.map.width() == 1 {
            NORM_TABLE[(self.map.value(doc_id)? & 0xFF) as usize]
        } else {
            1.0
        };
        let freq = u32::from(freq);
        Ok(if (freq as usize) < SCORE_CACHE_COUNT {
            norm * self.cache[freq as usize]
        } else {
            norm * (freq as f32).sqrt() * self.weight * self.idf
        })
    }
}

/// The pending operand: the bound posting cursor, or a popped bank.
enum DocStream<'b> {
    Posting(&'b mut PostingCursor),
    Bank { list: &'b HitList, pos: usize },
}

impl DocStream<'_> {
    fn dc(&self) -> u32 {
        match self {
            DocStream::Posting(c) => c.df,
            DocStream::Bank { list, .. } => list.len() as u32,
        }
    }

    fn advance(&mut self, scorer: &mut Scorer<'_>) -> Result<SrcDoc> {
        match self {
            DocStream::Posting(cursor) => {
                cursor.advance()?;
                let score = if scorer.n > 0 {
                    Score::Relevance(scorer.score(cursor.doc_id, cursor.freq)?)
                } else {
                    Score::None
                };
                Ok(SrcDoc {
                    doc_id: cursor.doc_id,
                    freq: cursor.freq,
                    score,
                    extra: Extra::None,
                })
            }
            DocStream::Bank { list, pos } => {
                let entry = list.entries[*pos];
                *pos += 1;
                Ok(SrcDoc {
                    doc_id: entry.doc_id,
                    freq: entry.freq,
                    score: entry.score,
                    extra: entry.extra,
                })
            }
        }
    }

    fn positions(&self) -> &[u16] {
        match self {
            DocStream::Posting(cursor) => &cursor.positions,
            DocStream::Bank { .. } => &[],
        }
    }
}

/// Positional join for phrase/proximity intersection: keep right positions
/// that land within `(left, left + near]`; `loose` keeps every in-window
/// position rather than exact `left + near` offsets. Consumed right
/// positions are never revisited. Returns the number kept.
fn join_positions(left: &[u16], right: &[u16], near: u16, loose: bool, out: &mut Vec<u16>) -> u16 {
    let mut kept = 0u16;
    let mut q = 0usize;
    for &lp in left {
        if q >= right.len() {
            break;
        }
        let lp = u32::from(lp);
        while q < right.len() {
            let rp = u32::from(right[q]);
            if rp > lp + u32::from(near) {
                break;
            }
            if rp <= lp {
                q += 1;
                continue;
            }
            if loose || rp == lp + u32::from(near) {
                out.push(right[q]);
                kept += 1;
            }
            q += 1;
        }
    }
    kept
}

fn relevance(score: Score) -> f32 {
    match score {
        Score::Relevance(v) => v,
        _ => 0.0,
    }
}

fn unset_extra(kind: ExtraKind) -> Extra {
    match kind {
        ExtraKind::None => Extra::None,
        ExtraKind::Int => Extra::Int(None),
        ExtraKind::Float => Extra::Float(None),
    }
}

fn extra_kind_of(list: &HitList) -> ExtraKind {
    list.extra_kind
}

/// Stack-based operator engine over one memory pool.
pub struct Evaluator<'a> {
    pool: &'a mut MemoryPool,
    /// Global result count enabling tf-idf scoring; 0 disables scoring.
    n: u32,
    score_cache: [f32; SCORE_CACHE_COUNT],
    sum_sq_weight: f32,
    saved: usize,
    withdraw: bool,
    set_freq: i32,
    random_scan: bool,
    estimate: u32,
    discarded: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(pool: &'a mut MemoryPool, n: u32) -> Self {
        Evaluator {
            pool,
            n,
            score_cache: [0.0; SCORE_CACHE_COUNT],
            sum_sq_weight: 0.0,
            saved: 0,
            withdraw: false,
            set_freq: 0,
            random_scan: false,
            estimate: 0,
            discarded: 0,
        }
    }

    /// Bind the pool's posting cursor to a resolved term of `reader`.
    pub fn read_postings(
        &mut self,
        reader: &SegmentReader,
        pointers: &TermPointers,
        want_positions: bool,
        zone: Option<(u32, u32)>,
    ) -> Result<u32> {
        reader.read_postings(self.pool, pointers, want_positions, zone)
    }

    /// Bind the pool's sort-map cursor to a column of `reader`.
    pub fn bind_sort_column(&mut self, reader: &SegmentReader, column: SortColumn) -> Result<()> {
        reader.bind_sort_column(self.pool, column)
    }

    /// Begin evaluating against a new segment: drop all result state.
    pub fn new_scan(&mut self) {
        self.saved = 0;
        self.withdraw = false;
        self.random_scan = false;
        self.estimate = 0;
        self.discarded = 0;
        self.sum_sq_weight = 0.0;
        self.pool.hits.clear();
        self.pool.iter.clear();
        self.op_reset();
    }

    /// Current result cardinality.
    pub fn count(&self) -> usize {
        if self.random_scan {
            self.estimate as usize
        } else if self.withdraw {
            self.pool.banks[self.saved].len()
        } else {
            self.pool.hits.len().saturating_sub(self.discarded)
        }
    }

    /// Record an estimated cardinality for a random (partial) scan.
    pub fn set_count(&mut self, estimate: u32) {
        self.estimate = estimate;
        self.random_scan = true;
    }

    /// When nonzero, materialized hits carry their term frequency as the
    /// integer extra value.
    pub fn set_freq(&mut self, mode: i32) {
        self.set_freq = mode;
    }

    pub fn saved(&self) -> usize {
        self.saved
    }

    pub fn is_withdrawn(&self) -> bool {
        self.withdraw
    }

    /// Drop the current result set and pending operand.
    pub fn abort(&mut self) {
        self.op_reset();
        self.pool.hits.clear_entries();
    }

    /// Drop only the pending operand binding.
    pub fn reset(&mut self) {
        self.op_reset();
    }

    /// Swap the current result set into `iter` for re-evaluation.
    pub fn reuse(&mut self) {
        std::mem::swap(&mut self.pool.hits, &mut self.pool.iter);
        self.pool.hits.clear_entries();
    }

    /// Save the current result set on the bank stack.
    pub fn push(&mut self) -> Result<usize> {
        if !self.pool.hits.is_empty() {
            if self.saved == MAX_BANKS {
                return Err(CallunaError::memory("bank stack limit reached"));
            }
            if self.saved == self.pool.banks.len() {
                let capacity = self.pool.config().bucket_capacity;
                self.pool.banks.push(HitList::new(capacity));
            }
            std::mem::swap(&mut self.pool.banks[self.saved], &mut self.pool.hits);
            self.saved += 1;
        }
        self.pool.hits.clear();
        Ok(self.saved)
    }

    /// Pop the newest bank as the pending operand, swapping it with the
    /// current result set first.
    pub fn pop_left(&mut self) -> usize {
        self.pop(true)
    }

    /// Pop the newest bank as the pending operand, keeping the current
    /// result set in place.
    pub fn pop_right(&mut self) -> usize {
        self.pop(false)
    }

    fn pop(&mut self, swap: bool) -> usize {
        if self.saved > 0 {
            self.saved -= 1;
            if swap {
                std::mem::swap(&mut self.pool.hits, &mut self.pool.banks[self.saved]);
            }
            self.pool.posting.weight = 1.0;
            self.withdraw = true;
        }
        self.saved
    }

    /// Bind the evaluator to the posting list the pool's cursor was read
    /// into: record the term's weight and IDF, and decode the whole list
    /// into the result set when it is empty.
    pub fn set(&mut self, df: u32, weight: f32) -> Result<usize> {
        self.pool.posting.weight = weight;
        if self.n > 0 {
            let df = df.max(1);
            let idf = (self.n as f32 / (df as f32 + 1.0)).ln() + 1.0;
            self.pool.posting.idf = idf;
            let unit = weight * idf;
            for (freq, slot) in self.score_cache.iter_mut().enumerate() {
                *slot = unit * (freq as f32).sqrt();
            }
            self.sum_sq_weight += unit * unit;
        }
        if !self.pool.hits.is_empty() {
            return Ok(self.pool.posting.df as usize);
        }
        if !self.pool.posting.active {
            return Err(CallunaError::invalid_argument("no posting list is bound"));
        }

        let n = self.n;
        let set_freq = self.set_freq != 0;
        let cache = self.score_cache;
        let MemoryPool {
            posting,
            score_map,
            hits,
            ..
        } = &mut *self.pool;
        let mut scorer = Scorer {
            n,
            cache,
            weight: posting.weight,
            idf: posting.idf,
            map: score_map,
        };

        hits.clear_entries();
        hits.df = posting.term_df;
        hits.has_prox = posting.has_prox;
        if set_freq {
            hits.extra_kind = ExtraKind::Int;
        }
        for _ in 0..posting.df {
            posting.advance()?;
            let score = if n > 0 {
                Score::Relevance(scorer.score(posting.doc_id, posting.freq)?)
            } else {
                Score::None
            };
            let extra = if set_freq {
                Extra::Int(Some(i64::from(posting.freq)))
            } else {
                Extra::None
            };
            hits.entries.push(Hit {
                doc_id: posting.doc_id,
                freq: posting.freq,
                score,
                extra,
            });
            if posting.has_prox {
                hits.prox.extend_from_slice(&posting.positions);
            }
        }
        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Intersect the previous result set with the pending operand. For
    /// positional sources, `near` bounds the allowed gap and `loose` keeps
    /// every in-window position rather than exact offsets.
    pub fn intersect(&mut self, near: u16, loose: bool) -> Result<usize> {
        if !self.withdraw && !self.pool.posting.active {
            return Ok(self.pool.hits.len());
        }
        self.swap_lists();

        let n = self.n;
        let withdraw = self.withdraw;
        let saved = self.saved;
        let set_freq = self.set_freq != 0;
        let cache = self.score_cache;
        let MemoryPool {
            posting,
            score_map,
            hits,
            iter,
            banks,
            ..
        } = &mut *self.pool;
        let mut scorer = Scorer {
            n,
            cache,
            weight: posting.weight,
            idf: posting.idf,
            map: score_map,
        };

        let (src_df, src_has_prox, src_has_sort, src_extra_kind) = if withdraw {
            let bank = &banks[saved];
            (bank.df, false, bank.has_sort_key, bank.extra_kind)
        } else {
            (posting.term_df, posting.has_prox, false, ExtraKind::None)
        };
        hits.df = src_df;
        let proceed_prox = src_has_prox && iter.has_prox;
        hits.has_prox = proceed_prox;

        let sort_side = if withdraw && src_has_sort {
            hits.has_sort_key = true;
            Side::Source
        } else if iter.has_sort_key {
            Side::Iter
        } else {
            Side::Neither
        };
        let extra_side = if withdraw && src_extra_kind != ExtraKind::None {
            hits.extra_kind = src_extra_kind;
            Side::Source
        } else if extra_kind_of(iter) != ExtraKind::None {
            Side::Iter
        } else {
            Side::Neither
        };

        let fast = !withdraw
            && posting.df > SKIP_INTERVAL
            && !iter.entries.is_empty()
            && posting.df / iter.entries.len() as u32 > SKIP_INTERVAL / 2;

        if fast {
            let mut prox_off = 0usize;
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                let left_len = entry.freq as usize;
                match posting.search(entry.doc_id)? {
                    Seek::Exhausted => break,
                    Seek::NotPresent => {
                        if proceed_prox {
                            prox_off += left_len;
                        }
                        continue;
                    }
                    Seek::Found => {
                        let score = if n > 0 {
                            Score::Relevance(scorer.score(posting.doc_id, posting.freq)?)
                        } else {
                            Score::None
                        };
                        let doc = SrcDoc {
                            doc_id: posting.doc_id,
                            freq: posting.freq,
                            score,
                            extra: Extra::None,
                        };
                        let joined = if proceed_prox {
                            let left = &iter.prox[prox_off..prox_off + left_len];
                            let kept =
                                join_positions(left, &posting.positions, near, loose, &mut hits.prox);
                            prox_off += left_len;
                            if kept == 0 {
                                continue;
                            }
                            Some(kept)
                        } else {
                            None
                        };
                        push_intersect_hit(
                            hits, n, set_freq, sort_side, extra_side, &entry, &doc, joined,
                        );
                    }
                }
            }
        } else {
            let mut src = if withdraw {
                DocStream::Bank {
                    list: &banks[saved],
                    pos: 0,
                }
            } else {
                DocStream::Posting(posting)
            };
            let src_dc = src.dc();
            let mut it = 0usize;
            let mut prox_off = 0usize;
            for _ in 0..src_dc {
                if it >= iter.entries.len() {
                    break;
                }
                let doc = src.advance(&mut scorer)?;
                while it < iter.entries.len() {
                    let entry = iter.entries[it];
                    if entry.doc_id > doc.doc_id {
                        break;
                    }
                    if entry.doc_id < doc.doc_id {
                        if proceed_prox {
                            prox_off += entry.freq as usize;
                        }
                        it += 1;
                        continue;
                    }
                    let joined = if proceed_prox {
                        let left = &iter.prox[prox_off..prox_off + entry.freq as usize];
                        let kept =
                            join_positions(left, src.positions(), near, loose, &mut hits.prox);
                        prox_off += entry.freq as usize;
                        Some(kept)
                    } else {
                        None
                    };
                    it += 1;
                    if joined == Some(0) {
                        break;
                    }
                    push_intersect_hit(
                        hits, n, set_freq, sort_side, extra_side, &entry, &doc, joined,
                    );
                    break;
                }
            }
        }

        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Docid-ordered union of the previous result set and the pending
    /// operand. Scores add; payloads missing on one side become unresolved.
    pub fn union(&mut self) -> Result<usize> {
        if !self.withdraw && !self.pool.posting.active {
            return Ok(self.pool.hits.len());
        }
        self.swap_lists();

        let n = self.n;
        let withdraw = self.withdraw;
        let saved = self.saved;
        let cache = self.score_cache;
        let MemoryPool {
            posting,
            score_map,
            hits,
            iter,
            banks,
            ..
        } = &mut *self.pool;
        let mut scorer = Scorer {
            n,
            cache,
            weight: posting.weight,
            idf: posting.idf,
            map: score_map,
        };

        let (src_df, src_has_sort, src_extra_kind) = if withdraw {
            let bank = &banks[saved];
            (bank.df, bank.has_sort_key, bank.extra_kind)
        } else {
            (posting.term_df, false, ExtraKind::None)
        };
        hits.df = src_df;
        hits.has_prox = false;

        let sort_side = if withdraw && src_has_sort {
            hits.has_sort_key = true;
            Side::Source
        } else if iter.has_sort_key {
            Side::Iter
        } else {
            Side::Neither
        };
        let iter_extra = extra_kind_of(iter);
        let extra_side = if withdraw && src_extra_kind != ExtraKind::None {
            hits.extra_kind = src_extra_kind;
            Side::Source
        } else if iter_extra != ExtraKind::None {
            Side::Iter
        } else {
            Side::Neither
        };

        let mut src = if withdraw {
            DocStream::Bank {
                list: &banks[saved],
                pos: 0,
            }
        } else {
            DocStream::Posting(posting)
        };
        let src_dc = src.dc();
        let mut it = 0usize;

        for _ in 0..src_dc {
            let doc = src.advance(&mut scorer)?;
            while it < iter.entries.len() && iter.entries[it].doc_id < doc.doc_id {
                let entry = iter.entries[it];
                push_union_hit(
                    hits,
                    n,
                    sort_side,
                    extra_side,
                    iter_extra,
                    src_extra_kind,
                    Some(&entry),
                    None,
                );
                it += 1;
            }
            if it < iter.entries.len() && iter.entries[it].doc_id == doc.doc_id {
                let entry = iter.entries[it];
                push_union_hit(
                    hits,
                    n,
                    sort_side,
                    extra_side,
                    iter_extra,
                    src_extra_kind,
                    Some(&entry),
                    Some(&doc),
                );
                it += 1;
            } else {
                push_union_hit(
                    hits,
                    n,
                    sort_side,
                    extra_side,
                    iter_extra,
                    src_extra_kind,
                    None,
                    Some(&doc),
                );
            }
        }
        while it < iter.entries.len() {
            let entry = iter.entries[it];
            push_union_hit(
                hits,
                n,
                sort_side,
                extra_side,
                iter_extra,
                src_extra_kind,
                Some(&entry),
                None,
            );
            it += 1;
        }

        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Set difference: the previous result set minus the pending operand.
    pub fn trim(&mut self) -> Result<usize> {
        if !self.withdraw && !self.pool.posting.active {
            return Ok(self.pool.hits.len());
        }
        self.swap_lists();

        let n = self.n;
        let withdraw = self.withdraw;
        let saved = self.saved;
        let cache = self.score_cache;
        let MemoryPool {
            posting,
            score_map,
            hits,
            iter,
            banks,
            ..
        } = &mut *self.pool;
        let mut scorer = Scorer {
            n,
            cache,
            weight: posting.weight,
            idf: posting.idf,
            map: score_map,
        };
        hits.has_prox = false;

        let fast = !withdraw
            && posting.df > SKIP_INTERVAL
            && !iter.entries.is_empty()
            && posting.df / iter.entries.len() as u32 > SKIP_INTERVAL / 2;

        let mut it = 0usize;
        if fast {
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                it = i + 1;
                match posting.search(entry.doc_id)? {
                    Seek::Found => continue,
                    Seek::NotPresent => push_iter_hit(hits, n, &entry),
                    Seek::Exhausted => {
                        it = i;
                        break;
                    }
                }
            }
        } else {
            let mut src = if withdraw {
                DocStream::Bank {
                    list: &banks[saved],
                    pos: 0,
                }
            } else {
                DocStream::Posting(posting)
            };
            let src_dc = src.dc();
            for _ in 0..src_dc {
                if it >= iter.entries.len() {
                    break;
                }
                let doc = src.advance(&mut scorer)?;
                while it < iter.entries.len() {
                    let entry = iter.entries[it];
                    if entry.doc_id > doc.doc_id {
                        break;
                    }
                    it += 1;
                    if entry.doc_id == doc.doc_id {
                        break;
                    }
                    push_iter_hit(hits, n, &entry);
                }
            }
        }
        while it < iter.entries.len() {
            let entry = iter.entries[it];
            push_iter_hit(hits, n, &entry);
            it += 1;
        }

        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Range filter over the bound sort-map column. With an empty result
    /// set this seeds one by scanning the column (reverse-biased to the
    /// most recent `want` docids when no bounds are given); otherwise it
    /// combines with the existing set per `op`. `set_key` loads the column
    /// value as each hit's sort key.
    pub fn between(
        &mut self,
        min: Option<i64>,
        max: Option<i64>,
        op: SetOp,
        set_key: bool,
        want: Option<u32>,
    ) -> Result<usize> {
        self.require_map()?;
        let load = self.pool.hits.is_empty();
        if !load {
            self.swap_lists();
        }

        let n = self.n;
        let MemoryPool {
            score_map,
            hits,
            iter,
            ..
        } = &mut *self.pool;
        let num_docs = score_map.num_docs;
        let in_range =
            |v: i64| min.map_or(true, |lo| v >= lo) && max.map_or(true, |hi| v < hi);

        if set_key {
            hits.has_sort_key = true;
        }
        let sort_side = if !set_key && iter.has_sort_key {
            Side::Iter
        } else {
            Side::Neither
        };
        let iter_extra = extra_kind_of(iter);

        if load {
            let start = match want {
                Some(want) if min.is_none() && max.is_none() => num_docs.saturating_sub(want),
                _ => 0,
            };
            for doc_id in start..num_docs {
                let value = score_map.value(doc_id)? as i64;
                if !in_range(value) {
                    continue;
                }
                let score = if n > 0 {
                    Score::Relevance(0.0)
                } else if set_key {
                    Score::Key(Some(value))
                } else {
                    Score::None
                };
                hits.entries.push(Hit {
                    doc_id,
                    freq: 0,
                    score,
                    extra: Extra::None,
                });
            }
        } else if op == SetOp::Union {
            let mut prev = 0u32;
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                for doc_id in prev..=entry.doc_id {
                    let value = score_map.value(doc_id)? as i64;
                    let is_entry = doc_id == entry.doc_id;
                    if !is_entry && !in_range(value) {
                        continue;
                    }
                    push_map_union_hit(
                        hits, n, set_key, sort_side, iter_extra, doc_id, value,
                        if is_entry { Some(&entry) } else { None },
                    );
                }
                prev = entry.doc_id + 1;
            }
            for doc_id in prev..num_docs {
                let value = score_map.value(doc_id)? as i64;
                if !in_range(value) {
                    continue;
                }
                push_map_union_hit(hits, n, set_key, sort_side, iter_extra, doc_id, value, None);
            }
        } else {
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                let value = score_map.value(entry.doc_id)? as i64;
                let matched = in_range(value);
                if (op == SetOp::Intersect && !matched) || (op == SetOp::Trim && matched) {
                    continue;
                }
                push_map_filter_hit(hits, n, set_key, sort_side, iter_extra, value, &entry);
            }
        }

        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Bitmask filter over the bound sort-map column; the same set algebra
    /// as [`between`](Self::between). A `want`-limited seed scan requires an
    /// all-ones mask.
    pub fn bit(
        &mut self,
        mask: u64,
        mode: BitMode,
        op: SetOp,
        set_key: bool,
        want: Option<u32>,
    ) -> Result<usize> {
        self.require_map()?;
        let load = self.pool.hits.is_empty();
        if !load {
            self.swap_lists();
        }

        let n = self.n;
        let MemoryPool {
            score_map,
            hits,
            iter,
            ..
        } = &mut *self.pool;
        let num_docs = score_map.num_docs;
        let matches = |v: u64| match mode {
            BitMode::All => v & mask == mask,
            BitMode::Any => v & mask != 0,
            BitMode::None => v & mask != mask,
        };

        if set_key {
            hits.has_sort_key = true;
        }
        let sort_side = if !set_key && iter.has_sort_key {
            Side::Iter
        } else {
            Side::Neither
        };
        let iter_extra = extra_kind_of(iter);

        if load {
            let start = match want {
                Some(want) if mask == u64::MAX => num_docs.saturating_sub(want),
                _ => 0,
            };
            for doc_id in start..num_docs {
                let value = score_map.value(doc_id)?;
                if !matches(value) {
                    continue;
                }
                let score = if n > 0 {
                    Score::Relevance(0.0)
                } else if set_key {
                    Score::Key(Some(value as i64))
                } else {
                    Score::None
                };
                hits.entries.push(Hit {
                    doc_id,
                    freq: 0,
                    score,
                    extra: Extra::None,
                });
            }
        } else if op == SetOp::Union {
            let mut prev = 0u32;
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                for doc_id in prev..=entry.doc_id {
                    let value = score_map.value(doc_id)?;
                    let is_entry = doc_id == entry.doc_id;
                    if !is_entry && !matches(value) {
                        continue;
                    }
                    push_map_union_hit(
                        hits, n, set_key, sort_side, iter_extra, doc_id, value as i64,
                        if is_entry { Some(&entry) } else { None },
                    );
                }
                prev = entry.doc_id + 1;
            }
            for doc_id in prev..num_docs {
                let value = score_map.value(doc_id)?;
                if !matches(value) {
                    continue;
                }
                push_map_union_hit(
                    hits, n, set_key, sort_side, iter_extra, doc_id, value as i64, None,
                );
            }
        } else {
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                let value = score_map.value(entry.doc_id)?;
                let matched = matches(value);
                if (op == SetOp::Intersect && !matched) || (op == SetOp::Trim && matched) {
                    continue;
                }
                push_map_filter_hit(hits, n, set_key, sort_side, iter_extra, value as i64, &entry);
            }
        }

        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Geo-distance filter over the bound coordinate column. Candidates are
    /// bracketed with a per-degree bounding box before the exact
    /// great-circle test; documents without a stored coordinate (latitude
    /// zero) never match. `set_extra` stores the computed distance in
    /// kilometers as the float extra.
    pub fn distance(
        &mut self,
        lat: u64,
        long: u64,
        radius_m: f64,
        op: SetOp,
        set_extra: bool,
    ) -> Result<usize> {
        self.require_map()?;
        let load = self.pool.hits.is_empty();
        if !load {
            self.swap_lists();
        }

        let n = self.n;
        let MemoryPool {
            score_map,
            hits,
            iter,
            ..
        } = &mut *self.pool;
        let num_docs = score_map.num_docs;
        let width = score_map.width();
        let precision = 10f64.powi(i32::from(width) - 2);
        let base_lat = decode_degrees(lat, width);
        let base_long = decode_degrees(long, width);
        let lat_delta = (radius_m / (LAT_DEGREE_M / precision)) as i64;
        let long_delta = (radius_m / (LONG_DEGREE_M / precision)) as i64;
        let (min_lat, max_lat) = (lat as i64 - lat_delta, lat as i64 + lat_delta);
        let (min_long, max_long) = (long as i64 - long_delta, long as i64 + long_delta);

        let measure = |map: &mut SortMapCursor, doc_id: u32| -> Result<Option<f64>> {
            let (other_lat, other_long) = map.coord(doc_id)?;
            let (other_lat, other_long) = (other_lat as i64, other_long as i64);
            if other_lat == 0 || other_lat > max_lat || other_lat < min_lat {
                return Ok(None);
            }
            if other_long > max_long || other_long < min_long {
                return Ok(None);
            }
            let d = earth_distance_m(
                base_lat,
                base_long,
                decode_degrees(other_lat as u64, width),
                decode_degrees(other_long as u64, width),
            );
            Ok(Some(d))
        };

        if set_extra {
            hits.extra_kind = ExtraKind::Float;
        }
        let sort_side = if iter.has_sort_key { Side::Iter } else { Side::Neither };
        let iter_extra = extra_kind_of(iter);

        if load {
            for doc_id in 0..num_docs {
                let Some(d) = measure(score_map, doc_id)? else {
                    continue;
                };
                if d > radius_m {
                    continue;
                }
                let score = if n > 0 { Score::Relevance(0.0) } else { Score::None };
                let extra = if set_extra {
                    Extra::Float(Some((d / 1000.0) as f32))
                } else {
                    Extra::None
                };
                hits.entries.push(Hit {
                    doc_id,
                    freq: 0,
                    score,
                    extra,
                });
            }
        } else if op == SetOp::Union {
            // a union rebuilt from the column invalidates carried sort keys
            hits.has_sort_key = false;
            let mut prev = 0u32;
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                for doc_id in prev..=entry.doc_id {
                    let is_entry = doc_id == entry.doc_id;
                    let d = match measure(score_map, doc_id)? {
                        Some(d) if is_entry || d <= radius_m => Some(d),
                        None if is_entry => None,
                        _ => continue,
                    };
                    let score = if n > 0 {
                        Score::Relevance(if is_entry { relevance(entry.score) } else { 0.0 })
                    } else {
                        Score::None
                    };
                    let extra = if set_extra {
                        Extra::Float(d.map(|d| (d / 1000.0) as f32))
                    } else if iter_extra != ExtraKind::None {
                        if is_entry { entry.extra } else { unset_extra(iter_extra) }
                    } else {
                        Extra::None
                    };
                    hits.entries.push(Hit {
                        doc_id,
                        freq: 0,
                        score,
                        extra,
                    });
                }
                prev = entry.doc_id + 1;
            }
            for doc_id in prev..num_docs {
                let Some(d) = measure(score_map, doc_id)? else {
                    continue;
                };
                if d > radius_m {
                    continue;
                }
                let score = if n > 0 { Score::Relevance(0.0) } else { Score::None };
                let extra = if set_extra {
                    Extra::Float(Some((d / 1000.0) as f32))
                } else {
                    unset_extra(iter_extra)
                };
                hits.entries.push(Hit {
                    doc_id,
                    freq: 0,
                    score,
                    extra,
                });
            }
        } else {
            for i in 0..iter.entries.len() {
                let entry = iter.entries[i];
                let Some(d) = measure(score_map, entry.doc_id)? else {
                    continue;
                };
                if (op == SetOp::Intersect && d > radius_m)
                    || (op == SetOp::Trim && d <= radius_m)
                {
                    continue;
                }
                let score = if n > 0 {
                    entry.score
                } else if sort_side == Side::Iter {
                    entry.score
                } else {
                    Score::None
                };
                let extra = if set_extra {
                    Extra::Float(Some((d / 1000.0) as f32))
                } else if iter_extra != ExtraKind::None {
                    entry.extra
                } else {
                    Extra::None
                };
                hits.entries.push(Hit {
                    doc_id: entry.doc_id,
                    freq: entry.freq,
                    score,
                    extra,
                });
            }
        }

        let count = hits.len();
        self.op_reset();
        Ok(count)
    }

    /// Fill unresolved sort keys from the bound column. Entries that came
    /// out of a union without a key carry `Key(None)` until this runs.
    pub fn resolve_sort_keys(&mut self) -> Result<usize> {
        self.require_map()?;
        let MemoryPool {
            score_map, hits, ..
        } = &mut *self.pool;
        let fill_all = !hits.has_sort_key;
        for entry in &mut hits.entries {
            let unresolved = match entry.score {
                Score::Key(Some(_)) => false,
                Score::Key(None) => true,
                _ => fill_all,
            };
            if unresolved || fill_all {
                entry.score = Score::Key(Some(score_map.value(entry.doc_id)? as i64));
            }
        }
        hits.has_sort_key = true;
        Ok(hits.len())
    }

    /// Fill unresolved geo distances (kilometers) from the bound coordinate
    /// column.
    pub fn resolve_distances(&mut self, lat: u64, long: u64) -> Result<usize> {
        self.require_map()?;
        let MemoryPool {
            score_map, hits, ..
        } = &mut *self.pool;
        let width = score_map.width();
        let base_lat = decode_degrees(lat, width);
        let base_long = decode_degrees(long, width);
        let fill_all = hits.extra_kind != ExtraKind::Float;
        for entry in &mut hits.entries {
            let unresolved = match entry.extra {
                Extra::Float(Some(_)) => false,
                Extra::Float(None) => true,
                _ => fill_all,
            };
            if unresolved || fill_all {
                let (other_lat, other_long) = score_map.coord(entry.doc_id)?;
                let d = earth_distance_m(
                    base_lat,
                    base_long,
                    decode_degrees(other_lat, width),
                    decode_degrees(other_long, width),
                );
                entry.extra = Extra::Float(Some((d / 1000.0) as f32));
            }
        }
        hits.extra_kind = ExtraKind::Float;
        Ok(hits.len())
    }

    /// Partially sort the result set so [`fetch`](Self::fetch) pages come
    /// out in the requested order; only `want` tail entries are ordered.
    pub fn sort(&mut self, want: usize, order: SortOrder, by_key: bool, by_extra: bool) {
        let n = self.n;
        let hits = &mut self.pool.hits;
        let want = if want == 0 || want > hits.len() {
            hits.len()
        } else {
            want
        };

        // fetch reads from the tail, so a descending page means ascending
        // in-array order
        let flip = |ord: Ordering| match order {
            SortOrder::Descending => ord,
            SortOrder::Ascending => ord.reverse(),
        };

        if by_key && hits.has_sort_key {
            heapsort_partial(&mut hits.entries, want, |a, b| {
                flip(key_of(a).cmp(&key_of(b)))
            });
        } else if by_extra && hits.extra_kind != ExtraKind::None {
            match hits.extra_kind {
                ExtraKind::Float => heapsort_partial(&mut hits.entries, want, |a, b| {
                    flip(extra_float_of(a).total_cmp(&extra_float_of(b)))
                }),
                _ => heapsort_partial(&mut hits.entries, want, |a, b| {
                    flip(extra_int_of(a).cmp(&extra_int_of(b)))
                }),
            }
        } else if n > 0 {
            heapsort_partial(&mut hits.entries, want, |a, b| {
                flip(relevance(a.score).total_cmp(&relevance(b.score)))
            });
        }
    }

    /// Page out up to `want` results from the tail of the result set,
    /// skipping bitmap-deleted documents and applying the query
    /// normalization factor to relevance scores. `want` of zero pages
    /// everything.
    pub fn fetch(
        &mut self,
        segment: u32,
        want: usize,
        deleted: Option<&DeletionBitmap>,
    ) -> Vec<HitDoc> {
        let hits = &self.pool.hits;
        let want = if want == 0 || want > hits.len() {
            hits.len()
        } else {
            want
        };
        let norm_q = if self.n > 0 && self.sum_sq_weight > 0.0 {
            1.0 / self.sum_sq_weight.sqrt()
        } else {
            1.0
        };

        let mut page = Vec::with_capacity(want);
        let mut dropped = 0u32;
        let mut index = hits.len();
        while index > 0 && page.len() < want {
            index -= 1;
            let entry = hits.entries[index];
            if deleted.is_some_and(|b| b.is_deleted(entry.doc_id)) {
                dropped += 1;
                continue;
            }
            let score = match entry.score {
                Score::Relevance(v) => Score::Relevance(v * norm_q),
                other => other,
            };
            page.push(HitDoc {
                segment,
                doc_id: entry.doc_id,
                extra: entry.extra,
                score,
            });
        }
        if self.random_scan {
            self.estimate = self.estimate.saturating_sub(dropped);
        } else {
            self.discarded += dropped as usize;
        }
        page
    }

    fn require_map(&self) -> Result<()> {
        if !self.pool.score_map.active {
            return Err(CallunaError::invalid_argument("sort map is not bound"));
        }
        Ok(())
    }

    /// Make the current result set the consumed operand and start an empty
    /// one, carrying the payload flags over.
    fn swap_lists(&mut self) {
        let pool = &mut *self.pool;
        std::mem::swap(&mut pool.hits, &mut pool.iter);
        pool.hits.clear_entries();
        pool.hits.has_prox = pool.iter.has_prox;
        pool.hits.has_sort_key = pool.iter.has_sort_key;
        pool.hits.extra_kind = pool.iter.extra_kind;
    }

    /// End-of-operator reset: release the posting and sort-map bindings and
    /// clear the withdrawn-bank state.
    fn op_reset(&mut self) {
        self.pool.posting.release();
        self.pool.score_map.unbind();
        self.withdraw = false;
    }
}

fn key_of(hit: &Hit) -> i64 {
    match hit.score {
        Score::Key(Some(v)) => v,
        _ => i64::MIN,
    }
}

fn extra_int_of(hit: &Hit) -> i64 {
    match hit.extra {
        Extra::Int(Some(v)) => v,
        _ => i64::MIN,
    }
}

fn extra_float_of(hit: &Hit) -> f32 {
    match hit.extra {
        Extra::Float(Some(v)) => v,
        _ => f32::MIN,
    }
}

#[allow(clippy::too_many_arguments)]
fn push_intersect_hit(
    hits: &mut HitList,
    n: u32,
    set_freq: bool,
    sort_side: Side,
    extra_side: Side,
    entry: &Hit,
    doc: &SrcDoc,
    joined: Option<u16>,
) {
    let score = if n > 0 {
        Score::Relevance(relevance(entry.score) + relevance(doc.score))
    } else {
        match sort_side {
            Side::Iter => entry.score,
            Side::Source => doc.score,
            Side::Neither => Score::None,
        }
    };
    let extra = if set_freq {
        entry.extra
    } else {
        match extra_side {
            Side::Iter => entry.extra,
            Side::Source => doc.extra,
            Side::Neither => Extra::None,
        }
    };
    hits.entries.push(Hit {
        doc_id: doc.doc_id,
        freq: joined.unwrap_or(doc.freq),
        score,
        extra,
    });
}

#[allow(clippy::too_many_arguments)]
fn push_union_hit(
    hits: &mut HitList,
    n: u32,
    sort_side: Side,
    extra_side: Side,
    iter_extra: ExtraKind,
    src_extra: ExtraKind,
    entry: Option<&Hit>,
    doc: Option<&SrcDoc>,
) {
    let doc_id = entry.map(|e| e.doc_id).or(doc.map(|d| d.doc_id)).unwrap_or(0);
    let score = if n > 0 {
        Score::Relevance(
            entry.map(|e| relevance(e.score)).unwrap_or(0.0)
                + doc.map(|d| relevance(d.score)).unwrap_or(0.0),
        )
    } else {
        match sort_side {
            Side::Iter => entry.map(|e| e.score).unwrap_or(Score::Key(None)),
            Side::Source => doc.map(|d| d.score).unwrap_or(Score::Key(None)),
            Side::Neither => Score::None,
        }
    };
    let extra = match extra_side {
        Side::Iter => entry.map(|e| e.extra).unwrap_or(unset_extra(iter_extra)),
        Side::Source => doc.map(|d| d.extra).unwrap_or(unset_extra(src_extra)),
        Side::Neither => Extra::None,
    };
    hits.entries.push(Hit {
        doc_id,
        freq: 0,
        score,
        extra,
    });
}

fn push_iter_hit(hits: &mut HitList, n: u32, entry: &Hit) {
    let score = if n > 0 {
        Score::Relevance(relevance(entry.score))
    } else {
        entry.score
    };
    hits.entries.push(Hit {
        doc_id: entry.doc_id,
        freq: entry.freq,
        score,
        extra: entry.extra,
    });
}

#[allow(clippy::too_many_arguments)]
fn push_map_union_hit(
    hits: &mut HitList,
    n: u32,
    set_key: bool,
    sort_side: Side,
    iter_extra: ExtraKind,
    doc_id: u32,
    value: i64,
    entry: Option<&Hit>,
) {
    let score = if n > 0 {
        Score::Relevance(entry.map(|e| relevance(e.score)).unwrap_or(0.0))
    } else if set_key {
        Score::Key(Some(value))
    } else if sort_side == Side::Iter {
        entry.map(|e| e.score).unwrap_or(Score::Key(None))
    } else {
        Score::None
    };
    let extra = if iter_extra != ExtraKind::None {
        entry.map(|e| e.extra).unwrap_or(unset_extra(iter_extra))
    } else {
        Extra::None
    };
    hits.entries.push(Hit {
        doc_id,
        freq: entry.map(|e| e.freq).unwrap_or(0),
        score,
        extra,
    });
}

fn push_map_filter_hit(
    hits: &mut HitList,
    n: u32,
    set_key: bool,
    sort_side: Side,
    iter_extra: ExtraKind,
    value: i64,
    entry: &Hit,
) {
    let score = if n > 0 {
        entry.score
    } else if set_key {
        Score::Key(Some(value))
    } else if sort_side == Side::Iter {
        entry.score
    } else {
        Score::None
    };
    let extra = if iter_extra != ExtraKind::None {
        entry.extra
    } else {
        Extra::None
    };
    hits.entries.push(Hit {
        doc_id: entry.doc_id,
        freq: entry.freq,
        score,
        extra,
    });
}
