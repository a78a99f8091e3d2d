use tempfile::TempDir;

use calluna::index::{SegmentReader, SegmentWriter, SegmentWriterConfig};
use calluna::memory::{MemoryPool, MemoryPoolConfig};
use calluna::DeletionBitmap;

#[test]
fn test_build_and_reopen_segment() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        SegmentWriter::create(dir.path(), "books", SegmentWriterConfig::default()).unwrap();

    let body = "the old lighthouse keeper kept a meticulous logbook";
    let doc_id = writer
        .add_document(
            &[b"The Lighthouse", body.as_bytes()],
            Some(body),
            &[
                (0, "lighthouse", 1),
                (1, "old", 2),
                (1, "lighthouse", 3),
                (1, "keeper", 4),
                (1, "logbook", 8),
            ],
        )
        .unwrap();
    assert_eq!(doc_id, 0);
    writer
        .add_document(
            &[b"Harbor Nights", b"a short harbor tale"],
            Some("a short harbor tale"),
            &[(0, "harbor", 1), (1, "harbor", 2), (1, "tale", 4)],
        )
        .unwrap();
    let meta = writer.commit().unwrap();
    assert_eq!(meta.num_docs, 2);
    assert_eq!(meta.num_terms, 8);

    let reader = SegmentReader::open(dir.path(), "books").unwrap();
    assert_eq!(reader.num_docs(), 2);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();

    // field-scoped terms resolve independently
    let title = reader.get(&mut pool, 0, "lighthouse").unwrap().unwrap();
    assert_eq!(title.df, 1);
    let body_term = reader.get(&mut pool, 1, "lighthouse").unwrap().unwrap();
    assert_eq!(body_term.df, 1);
    assert!(reader.get(&mut pool, 1, "logbook").unwrap().is_some());
    assert!(reader.get(&mut pool, 0, "logbook").unwrap().is_none());

    // stored fields round-trip
    assert_eq!(reader.docs.read(&mut pool, 0, 0).unwrap(), b"The Lighthouse");
    assert_eq!(reader.docs.read(&mut pool, 1, 0).unwrap(), b"Harbor Nights");
}

#[test]
fn test_excerpt_from_segment() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        SegmentWriter::create(dir.path(), "notes", SegmentWriterConfig::default()).unwrap();
    let body = "granite cliffs rise over the harbor while gulls wheel above \
                the harbor wall in the evening light";
    writer
        .add_document(&[b"Cliffs"], Some(body), &[(0, "harbor", 1)])
        .unwrap();
    writer.commit().unwrap();

    let reader = SegmentReader::open(dir.path(), "notes").unwrap();
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let (field, excerpt) = reader
        .docs
        .read_excerpt(&mut pool, 0, 0, 16, &["harbor"])
        .unwrap();
    assert_eq!(field, b"Cliffs");
    assert!(excerpt.contains("<b>harbor</b>"), "excerpt: {excerpt}");
}

#[test]
fn test_deletion_bitmap_round_trip_through_segment() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        SegmentWriter::create(dir.path(), "dels", SegmentWriterConfig::default()).unwrap();
    for i in 0..10u32 {
        let body = format!("doc {i}");
        writer
            .add_document(&[body.as_bytes()], None, &[(0, "doc", 1)])
            .unwrap();
    }
    writer.commit().unwrap();

    let reader = SegmentReader::open(dir.path(), "dels").unwrap();
    assert!(reader.load_deletions().unwrap().is_none());

    let mut bitmap = DeletionBitmap::new(10);
    bitmap.delete(4).unwrap();
    bitmap.delete(9).unwrap();
    reader.save_deletions(&bitmap).unwrap();

    let loaded = reader.load_deletions().unwrap().unwrap();
    assert_eq!(loaded.deleted_count(), 2);
    assert!(loaded.is_deleted(4));
    assert!(loaded.is_deleted(9));
    assert!(!loaded.is_deleted(0));
}

#[test]
fn test_writer_rejects_oversized_tokens() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        SegmentWriter::create(dir.path(), "caps", SegmentWriterConfig::default()).unwrap();
    let long = "y".repeat(120);
    let result = writer.add_document(&[b"x"], None, &[(0, long.as_str(), 1)]);
    assert!(result.is_err());
}
