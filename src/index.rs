//! Inverted index structures: postings, term dictionary, segments.

pub mod builder;
pub mod deletion;
pub mod dictionary;
pub mod merge;
pub mod posting;
pub mod segment;

pub use builder::{SegmentMeta, SegmentReader, SegmentWriter, SegmentWriterConfig};
pub use deletion::DeletionBitmap;
pub use dictionary::{TermDictionary, TermDictionaryWriter, TermRecord, INDEX_INTERVAL, MAX_TERM_LEN};
pub use merge::{merge_segments, MergeSource, MergeStats};
pub use posting::{PostingCursor, PostingDoc, PostingWriter, Seek, TermPointers, SKIP_INTERVAL};
pub use segment::{SegmentFiles, SegmentMergeInfo};
