//! Result-set working memory.
//!
//! A [`HitList`] is the decode-time bucket a posting list is materialized
//! into and the unit the evaluator's set algebra operates on. Entries are
//! overwritten by the next decode; capacity is retained between queries and
//! accounted by the owning pool.

/// Score payload of a hit.
///
/// A result set is either relevance-scored (tf-idf) or carries a sort key
/// from the sort map. `Key(None)` marks a docid that entered the set through
/// a union side that had no key yet; it is resolved lazily from the map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Score {
    None,
    Relevance(f32),
    Key(Option<i64>),
}

/// Auxiliary per-hit value: a term frequency or integer column value, or a
/// computed geo distance. `Int(None)` / `Float(None)` mark unresolved
/// entries, as with [`Score::Key`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Extra {
    None,
    Int(Option<i64>),
    Float(Option<f32>),
}

/// Which extra payload the entries of a list carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtraKind {
    None,
    Int,
    Float,
}

/// One result-set entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub doc_id: u32,
    pub freq: u16,
    pub score: Score,
    pub extra: Extra,
}

/// A reusable result set: entries plus a parallel position bucket. When
/// `has_prox` is set, each entry's `freq` positions live contiguously in
/// `prox`, in entry order.
#[derive(Debug)]
pub struct HitList {
    pub entries: Vec<Hit>,
    pub prox: Vec<u16>,
    pub has_prox: bool,
    pub has_sort_key: bool,
    pub extra_kind: ExtraKind,
    /// Document frequency of the term this set came from.
    pub df: u32,
}

impl HitList {
    pub fn new(capacity: usize) -> Self {
        HitList {
            entries: Vec::with_capacity(capacity),
            prox: Vec::with_capacity(capacity),
            has_prox: false,
            has_sort_key: false,
            extra_kind: ExtraKind::None,
            df: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop contents but keep payload flags (used after a result-set swap).
    pub fn clear_entries(&mut self) {
        self.entries.clear();
        self.prox.clear();
    }

    /// Drop contents and flags.
    pub fn clear(&mut self) {
        self.clear_entries();
        self.has_prox = false;
        self.has_sort_key = false;
        self.extra_kind = ExtraKind::None;
        self.df = 0;
    }

    /// Bytes currently reserved, for pool usage accounting.
    pub fn capacity_bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Hit>()
            + self.prox.capacity() * std::mem::size_of::<u16>()
    }

    /// Release surplus capacity back to `base` entries.
    pub fn shrink(&mut self, base: usize) {
        self.clear();
        self.entries.shrink_to(base);
        self.prox.shrink_to(base);
    }
}
