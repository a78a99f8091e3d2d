use std::sync::Arc;

use tempfile::TempDir;

use calluna::index::posting::{PostingCursor, PostingDoc, PostingWriter, Seek, TermPointers};
use calluna::io::SharedFile;

fn docs_for(df: u32, with_positions: bool) -> Vec<PostingDoc> {
    (0..df)
        .map(|i| {
            let freq = i % 4 + 1;
            PostingDoc {
                doc_id: i * 3 + 1,
                freq,
                positions: if with_positions {
                    (0..freq).map(|p| (p + 1) * 2 + (i % 5) as u32).map(|p| p as u16).collect()
                } else {
                    Vec::new()
                },
            }
        })
        .collect()
}

fn write_segment(
    dir: &TempDir,
    docs: &[PostingDoc],
) -> (Arc<SharedFile>, Arc<SharedFile>, TermPointers) {
    let frq = SharedFile::create(dir.path().join("t.frq")).unwrap();
    let prx = SharedFile::create(dir.path().join("t.prx")).unwrap();
    let mut writer = PostingWriter::new(Arc::clone(&frq), Arc::clone(&prx)).unwrap();
    let ptrs = writer.write_term(docs).unwrap();
    writer.flush().unwrap();
    (frq, prx, ptrs)
}

#[test]
fn test_round_trip_across_skip_interval_boundaries() {
    // document counts straddling 0, 1, SKIP_INTERVAL-1, SKIP_INTERVAL,
    // SKIP_INTERVAL+1 and 10x SKIP_INTERVAL
    for df in [0u32, 1, 15, 16, 17, 160] {
        let dir = TempDir::new().unwrap();
        let docs = docs_for(df, true);
        let (frq, prx, ptrs) = write_segment(&dir, &docs);
        assert_eq!(ptrs.df, df);

        let mut cursor = PostingCursor::new(256).unwrap();
        let dc = cursor.read(&frq, &prx, &ptrs, true, None).unwrap();
        assert_eq!(dc, df);
        for doc in &docs {
            cursor.advance().unwrap();
            assert_eq!(cursor.doc_id, doc.doc_id, "df={df}");
            assert_eq!(u32::from(cursor.freq), doc.freq);
            assert_eq!(cursor.positions, doc.positions);
        }
    }
}

#[test]
fn test_round_trip_without_positions() {
    let dir = TempDir::new().unwrap();
    let docs = docs_for(40, false);
    let (frq, prx, ptrs) = write_segment(&dir, &docs);
    assert_eq!(ptrs.prox_len, 0);

    let mut cursor = PostingCursor::new(256).unwrap();
    cursor.read(&frq, &prx, &ptrs, true, None).unwrap();
    for doc in &docs {
        cursor.advance().unwrap();
        assert_eq!(cursor.doc_id, doc.doc_id);
        assert!(cursor.positions.is_empty());
    }
}

#[test]
fn test_search_matches_linear_scan() {
    for df in [1u32, 15, 16, 17, 160] {
        let dir = TempDir::new().unwrap();
        let docs = docs_for(df, true);
        let (frq, prx, ptrs) = write_segment(&dir, &docs);
        let last_doc = docs.last().unwrap().doc_id;

        for target in 0..=last_doc + 5 {
            let mut cursor = PostingCursor::new(256).unwrap();
            cursor.read(&frq, &prx, &ptrs, true, None).unwrap();
            let outcome = cursor.search(target).unwrap();
            let expected = if docs.iter().any(|d| d.doc_id == target) {
                Seek::Found
            } else if target > last_doc {
                Seek::Exhausted
            } else {
                Seek::NotPresent
            };
            assert_eq!(outcome, expected, "df={df} target={target}");
            if expected == Seek::Found {
                let doc = docs.iter().find(|d| d.doc_id == target).unwrap();
                assert_eq!(u32::from(cursor.freq), doc.freq);
                assert_eq!(cursor.positions, doc.positions);
            }
        }
    }
}

#[test]
fn test_ascending_searches_on_one_binding() {
    let dir = TempDir::new().unwrap();
    let docs = docs_for(160, true);
    let (frq, prx, ptrs) = write_segment(&dir, &docs);

    let mut cursor = PostingCursor::new(256).unwrap();
    cursor.read(&frq, &prx, &ptrs, true, None).unwrap();
    // every fourth present docid, in ascending order, on a single binding
    for doc in docs.iter().step_by(4) {
        assert_eq!(cursor.search(doc.doc_id).unwrap(), Seek::Found);
        assert_eq!(u32::from(cursor.freq), doc.freq);
        assert_eq!(cursor.positions, doc.positions);
    }
}

#[test]
fn test_search_empty_list_is_exhausted() {
    let dir = TempDir::new().unwrap();
    let (frq, prx, ptrs) = write_segment(&dir, &[]);
    let mut cursor = PostingCursor::new(256).unwrap();
    cursor.read(&frq, &prx, &ptrs, false, None).unwrap();
    assert_eq!(cursor.search(7).unwrap(), Seek::Exhausted);
}

#[test]
fn test_zone_limits_decoding() {
    let dir = TempDir::new().unwrap();
    let docs = docs_for(50, false);
    let (frq, prx, ptrs) = write_segment(&dir, &docs);

    let mut cursor = PostingCursor::new(256).unwrap();
    let dc = cursor.read(&frq, &prx, &ptrs, false, Some((10, 20))).unwrap();
    assert_eq!(dc, 20);
    cursor.advance().unwrap();
    assert_eq!(cursor.doc_id, docs[10].doc_id);
}

#[test]
fn test_multiple_terms_share_streams() {
    let dir = TempDir::new().unwrap();
    let frq = SharedFile::create(dir.path().join("m.frq")).unwrap();
    let prx = SharedFile::create(dir.path().join("m.prx")).unwrap();
    let mut writer = PostingWriter::new(Arc::clone(&frq), Arc::clone(&prx)).unwrap();

    let first = docs_for(20, true);
    let second: Vec<PostingDoc> = docs_for(33, true)
        .into_iter()
        .map(|mut d| {
            d.doc_id += 1;
            d
        })
        .collect();
    let first_ptrs = writer.write_term(&first).unwrap();
    let second_ptrs = writer.write_term(&second).unwrap();
    writer.flush().unwrap();
    assert!(second_ptrs.freq_ptr > first_ptrs.freq_ptr);

    let mut cursor = PostingCursor::new(256).unwrap();
    cursor.read(&frq, &prx, &second_ptrs, true, None).unwrap();
    for doc in &second {
        cursor.advance().unwrap();
        assert_eq!(cursor.doc_id, doc.doc_id);
    }
    cursor.read(&frq, &prx, &first_ptrs, true, None).unwrap();
    for doc in &first {
        cursor.advance().unwrap();
        assert_eq!(cursor.doc_id, doc.doc_id);
    }
}

#[test]
fn test_writer_rejects_disorder() {
    let dir = TempDir::new().unwrap();
    let frq = SharedFile::create(dir.path().join("d.frq")).unwrap();
    let prx = SharedFile::create(dir.path().join("d.prx")).unwrap();
    let mut writer = PostingWriter::new(frq, prx).unwrap();

    writer.begin_term();
    writer.push(5, 1, &[]).unwrap();
    assert!(writer.push(5, 1, &[]).is_err());
    assert!(writer.push(3, 1, &[]).is_err());

    writer.begin_term();
    assert!(writer.push(1, 0, &[]).is_err());
    assert!(writer.push(1, 2, &[4, 3]).is_err());
    assert!(writer.push(1, 2, &[4]).is_err());
}
