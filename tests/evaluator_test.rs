use tempfile::TempDir;

use calluna::index::{SegmentReader, SegmentWriter, SegmentWriterConfig, TermPointers};
use calluna::memory::{MemoryPool, MemoryPoolConfig};
use calluna::search::{BitMode, Evaluator, Extra, HitDoc, Score, SetOp, SortOrder};
use calluna::store::sortmap::encode_degrees;
use calluna::store::SortColumn;
use calluna::DeletionBitmap;

fn doc_ids(page: &[HitDoc]) -> Vec<u32> {
    let mut ids: Vec<u32> = page.iter().map(|h| h.doc_id).collect();
    ids.sort_unstable();
    ids
}

/// Six documents: "cat" in {1, 3, 4}, "dog" in {2, 3, 5}, a 4-byte sort
/// column holding docid * 10.
fn build_animals(dir: &TempDir) -> (SegmentReader, Vec<SortColumn>) {
    let mut writer =
        SegmentWriter::create(dir.path(), "animals", SegmentWriterConfig::default()).unwrap();
    let column = writer.add_sort_column(4).unwrap();
    let docs: [&[(u8, &str, u32)]; 6] = [
        &[],
        &[(0, "cat", 1)],
        &[(0, "dog", 1)],
        &[(0, "cat", 1), (0, "dog", 2)],
        &[(0, "cat", 1)],
        &[(0, "dog", 1)],
    ];
    for (i, tokens) in docs.iter().enumerate() {
        let stored = format!("doc{i}");
        writer
            .add_document(&[stored.as_bytes()], None, tokens)
            .unwrap();
        writer.push_sort_value(column, i as u64 * 10).unwrap();
    }
    let meta = writer.commit().unwrap();
    assert_eq!(meta.num_docs, 6);
    let reader = SegmentReader::open(dir.path(), "animals").unwrap();
    (reader, meta.sort_columns)
}

fn lookup(reader: &SegmentReader, pool: &mut MemoryPool, term: &str) -> TermPointers {
    reader.get(pool, 0, term).unwrap().unwrap()
}

#[test]
fn test_intersect_union_trim_scenario() {
    let dir = TempDir::new().unwrap();
    let (reader, _) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");
    let dog = lookup(&reader, &mut pool, "dog");

    let mut eval = Evaluator::new(&mut pool, 0);

    // cat * dog -> {3}
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    assert_eq!(eval.set(cat.df, 1.0).unwrap(), 3);
    eval.read_postings(&reader, &dog, false, None).unwrap();
    eval.set(dog.df, 1.0).unwrap();
    assert_eq!(eval.intersect(1, false).unwrap(), 1);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![3]);

    // cat + dog -> {1, 2, 3, 4, 5}
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    eval.read_postings(&reader, &dog, false, None).unwrap();
    eval.set(dog.df, 1.0).unwrap();
    assert_eq!(eval.union().unwrap(), 5);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 2, 3, 4, 5]);

    // cat - dog -> {1, 4}
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    eval.read_postings(&reader, &dog, false, None).unwrap();
    eval.set(dog.df, 1.0).unwrap();
    assert_eq!(eval.trim().unwrap(), 2);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 4]);
}

#[test]
fn test_set_algebra_properties() {
    let dir = TempDir::new().unwrap();
    let (reader, _) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");
    let dog = lookup(&reader, &mut pool, "dog");

    let mut eval = Evaluator::new(&mut pool, 0);
    let mut run = |first: &TermPointers, second: &TermPointers, op: &str| -> Vec<u32> {
        eval.new_scan();
        eval.read_postings(&reader, first, false, None).unwrap();
        eval.set(first.df, 1.0).unwrap();
        eval.read_postings(&reader, second, false, None).unwrap();
        eval.set(second.df, 1.0).unwrap();
        match op {
            "*" => eval.intersect(1, false).unwrap(),
            "+" => eval.union().unwrap(),
            _ => eval.trim().unwrap(),
        };
        doc_ids(&eval.fetch(0, 0, None))
    };

    // commutativity of intersect and union on docid sets
    assert_eq!(run(&cat, &dog, "*"), run(&dog, &cat, "*"));
    assert_eq!(run(&cat, &dog, "+"), run(&dog, &cat, "+"));
    // idempotence and self-difference
    assert_eq!(run(&cat, &cat, "*"), vec![1, 3, 4]);
    assert_eq!(run(&cat, &cat, "+"), vec![1, 3, 4]);
    assert_eq!(run(&cat, &cat, "-"), Vec::<u32>::new());
}

#[test]
fn test_union_via_bank_stack() {
    // union(A, trim(B, A)) == union(A, B)
    let dir = TempDir::new().unwrap();
    let (reader, _) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");
    let dog = lookup(&reader, &mut pool, "dog");

    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();

    // A = cat, saved on the bank stack
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    assert_eq!(eval.push().unwrap(), 1);
    assert_eq!(eval.saved(), 1);

    // hits = trim(B = dog, A = cat)
    eval.read_postings(&reader, &dog, false, None).unwrap();
    eval.set(dog.df, 1.0).unwrap();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    assert_eq!(eval.trim().unwrap(), 2); // {2, 5}

    // union with the popped bank
    eval.pop_left();
    assert!(eval.is_withdrawn());
    assert_eq!(eval.union().unwrap(), 5);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 2, 3, 4, 5]);
    assert_eq!(eval.saved(), 0);
}

#[test]
fn test_scored_union_ranks_double_match_first() {
    let dir = TempDir::new().unwrap();
    let (reader, _) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");
    let dog = lookup(&reader, &mut pool, "dog");

    let mut eval = Evaluator::new(&mut pool, 6);
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    eval.read_postings(&reader, &dog, false, None).unwrap();
    eval.set(dog.df, 1.0).unwrap();
    eval.union().unwrap();
    eval.sort(0, SortOrder::Descending, false, false);

    let page = eval.fetch(0, 0, None);
    assert_eq!(page.len(), 5);
    // doc 3 holds both terms, so its summed score leads
    assert_eq!(page[0].doc_id, 3);
    for hit in &page {
        match hit.score {
            Score::Relevance(v) => assert!(v > 0.0),
            other => panic!("expected relevance score, got {other:?}"),
        }
    }
}

#[test]
fn test_between_load_and_combine() {
    let dir = TempDir::new().unwrap();
    let (reader, columns) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");

    let mut eval = Evaluator::new(&mut pool, 0);

    // seed from the column: 20 <= value < 40
    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .between(Some(20), Some(40), SetOp::Intersect, true, None)
        .unwrap();
    assert_eq!(count, 2);
    let page = eval.fetch(0, 0, None);
    assert_eq!(doc_ids(&page), vec![2, 3]);
    for hit in &page {
        assert!(matches!(hit.score, Score::Key(Some(20 | 30))));
    }

    // filter an existing posting result: cat {1,3,4} with 10 <= v < 35
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .between(Some(10), Some(35), SetOp::Intersect, false, None)
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 3]);

    // union widens: cat + {v >= 50}
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .between(Some(50), None, SetOp::Union, false, None)
        .unwrap();
    assert_eq!(count, 4);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 3, 4, 5]);

    // trim narrows: cat - {v >= 30}
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .between(Some(30), None, SetOp::Trim, false, None)
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1]);
}

#[test]
fn test_between_reverse_biased_seed() {
    let dir = TempDir::new().unwrap();
    let (reader, columns) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();

    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    // no bounds and an explicit want: only the most recent docids
    let count = eval
        .between(None, None, SetOp::Intersect, false, Some(2))
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![4, 5]);
}

#[test]
fn test_bit_filter() {
    let dir = TempDir::new().unwrap();
    let (reader, columns) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();

    let mut eval = Evaluator::new(&mut pool, 0);

    // values are 0,10,20,30,40,50; bit 2 is set in 10, 30 and 50
    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .bit(2, BitMode::Any, SetOp::Intersect, false, None)
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 3, 5]);

    // "none" keeps documents not carrying every mask bit
    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .bit(2, BitMode::None, SetOp::Intersect, false, None)
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![0, 2, 4]);

    // all: 8|2 = 10 requires both bits, held by 10 and 30
    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    let count = eval
        .bit(10, BitMode::All, SetOp::Intersect, false, None)
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![1, 3]);
}

#[test]
fn test_sort_key_paging() {
    let dir = TempDir::new().unwrap();
    let (reader, columns) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();

    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    eval.between(None, None, SetOp::Intersect, true, None)
        .unwrap();

    eval.sort(3, SortOrder::Descending, true, false);
    let page = eval.fetch(0, 3, None);
    let keys: Vec<i64> = page
        .iter()
        .map(|h| match h.score {
            Score::Key(Some(k)) => k,
            other => panic!("expected key, got {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![50, 40, 30]);

    eval.new_scan();
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    eval.between(None, None, SetOp::Intersect, true, None)
        .unwrap();
    eval.sort(3, SortOrder::Ascending, true, false);
    let page = eval.fetch(0, 3, None);
    let keys: Vec<i64> = page
        .iter()
        .map(|h| match h.score {
            Score::Key(Some(k)) => k,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(keys, vec![0, 10, 20]);
}

#[test]
fn test_resolve_sort_keys_fills_missing_keys() {
    let dir = TempDir::new().unwrap();
    let (reader, columns) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");

    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();

    // postings carry no keys; resolve them all from the column
    eval.bind_sort_column(&reader, columns[0]).unwrap();
    eval.resolve_sort_keys().unwrap();
    eval.sort(0, SortOrder::Descending, true, false);
    let page = eval.fetch(0, 0, None);
    let keys: Vec<i64> = page
        .iter()
        .map(|h| match h.score {
            Score::Key(Some(k)) => k,
            other => panic!("expected key, got {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![40, 30, 10]);
}

#[test]
fn test_phrase_intersection() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        SegmentWriter::create(dir.path(), "phrases", SegmentWriterConfig::default()).unwrap();
    let docs: [&[(u8, &str, u32)]; 3] = [
        &[(0, "quick", 1), (0, "brown", 2), (0, "fox", 3)],
        &[(0, "brown", 1), (0, "quick", 2)],
        &[(0, "quick", 1), (0, "lazy", 2), (0, "brown", 3)],
    ];
    for tokens in &docs {
        writer.add_document(&[b"p"], None, tokens).unwrap();
    }
    writer.commit().unwrap();
    let reader = SegmentReader::open(dir.path(), "phrases").unwrap();

    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let quick = lookup(&reader, &mut pool, "quick");
    let brown = lookup(&reader, &mut pool, "brown");

    let mut eval = Evaluator::new(&mut pool, 0);

    // exact phrase "quick brown"
    eval.new_scan();
    eval.read_postings(&reader, &quick, true, None).unwrap();
    eval.set(quick.df, 1.0).unwrap();
    eval.read_postings(&reader, &brown, true, None).unwrap();
    eval.set(brown.df, 1.0).unwrap();
    assert_eq!(eval.intersect(1, false).unwrap(), 1);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![0]);

    // loose proximity within two positions
    eval.new_scan();
    eval.read_postings(&reader, &quick, true, None).unwrap();
    eval.set(quick.df, 1.0).unwrap();
    eval.read_postings(&reader, &brown, true, None).unwrap();
    eval.set(brown.df, 1.0).unwrap();
    assert_eq!(eval.intersect(2, true).unwrap(), 2);
    assert_eq!(doc_ids(&eval.fetch(0, 0, None)), vec![0, 2]);
}

#[test]
fn test_distance_filter() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        SegmentWriter::create(dir.path(), "places", SegmentWriterConfig::default()).unwrap();
    let geo = writer.add_sort_column(8).unwrap();
    let places = [
        Some((48.8566, 2.3522)),  // Paris
        Some((48.8049, 2.1204)),  // Versailles, ~20 km away
        Some((51.5074, -0.1278)), // London, ~344 km away
        None,                     // no stored coordinate
    ];
    for (i, place) in places.iter().enumerate() {
        let name = format!("place{i}");
        writer
            .add_document(&[name.as_bytes()], None, &[(0, "place", 1)])
            .unwrap();
        match place {
            Some((lat, long)) => writer
                .push_sort_coord(geo, encode_degrees(*lat, 8), encode_degrees(*long, 8))
                .unwrap(),
            None => writer.push_sort_coord(geo, 0, 0).unwrap(),
        }
    }
    let meta = writer.commit().unwrap();
    let reader = SegmentReader::open(dir.path(), "places").unwrap();

    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();
    eval.bind_sort_column(&reader, meta.sort_columns[geo]).unwrap();
    let count = eval
        .distance(
            encode_degrees(48.8566, 8),
            encode_degrees(2.3522, 8),
            50_000.0,
            SetOp::Intersect,
            true,
        )
        .unwrap();
    assert_eq!(count, 2);

    let page = eval.fetch(0, 0, None);
    assert_eq!(doc_ids(&page), vec![0, 1]);
    for hit in &page {
        match hit.extra {
            Extra::Float(Some(km)) => assert!(km < 50.0),
            other => panic!("expected distance extra, got {other:?}"),
        }
    }
}

#[test]
fn test_fetch_skips_deleted_documents() {
    let dir = TempDir::new().unwrap();
    let (reader, _) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let cat = lookup(&reader, &mut pool, "cat");

    let mut bitmap = DeletionBitmap::new(6);
    bitmap.delete(3).unwrap();

    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();
    eval.read_postings(&reader, &cat, false, None).unwrap();
    eval.set(cat.df, 1.0).unwrap();
    assert_eq!(eval.count(), 3);

    let page = eval.fetch(0, 0, Some(&bitmap));
    assert_eq!(doc_ids(&page), vec![1, 4]);
    assert_eq!(eval.count(), 2);
}

#[test]
fn test_random_scan_estimate() {
    let dir = TempDir::new().unwrap();
    let (reader, _) = build_animals(&dir);
    let mut pool = MemoryPool::new(MemoryPoolConfig::default()).unwrap();
    let dog = lookup(&reader, &mut pool, "dog");

    let mut eval = Evaluator::new(&mut pool, 0);
    eval.new_scan();
    // partial decode of the first two postings, estimated at the full df
    eval.read_postings(&reader, &dog, false, Some((0, 2))).unwrap();
    eval.set(dog.df, 1.0).unwrap();
    eval.set_count(dog.df);
    assert_eq!(eval.count(), 3);
    let page = eval.fetch(0, 0, None);
    assert_eq!(page.len(), 2);
}
