use std::fs;
use std::sync::Arc;
use std::thread;

use tempfile::tempdir;
use vekta_rag::storage::{CONFIG_FILE, INDEX_FILE, METADATA_FILE};
use vekta_rag::{
    Chunk, DocumentInfo, EmbeddedChunk, FileType, StoreError, StructuralCount, VectorIndex,
};

fn entry(doc: &str, id: usize, vector: Vec<f32>) -> EmbeddedChunk {
    EmbeddedChunk::new(
        Chunk {
            id,
            source_document: doc.to_string(),
            text: format!("{doc}#{id}"),
            start_offset: id * 8,
            end_offset: id * 8 + 10,
            sequence_index: id,
            token_count: 1,
            document: DocumentInfo {
                file_name: doc.to_string(),
                file_type: FileType::Pdf,
                structural_count: StructuralCount::Pages(3),
            },
        },
        vector,
    )
}

fn grid(doc: &str, n: usize) -> Vec<EmbeddedChunk> {
    (0..n)
        .map(|i| entry(doc, i, vec![i as f32, (i * i) as f32 * 0.1, 1.0]))
        .collect()
}

#[test]
fn test_reopen_preserves_stats_and_results() {
    let dir = tempdir().unwrap();
    let query = [2.2, 0.3, 1.0];

    let (stats, hits) = {
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(grid("a.pdf", 6)).unwrap();
        index.add(grid("b.pdf", 4)).unwrap();
        (index.stats().unwrap(), index.search(&query, 5).unwrap())
    };

    let reopened = VectorIndex::open(dir.path(), None).unwrap();
    assert_eq!(reopened.stats().unwrap(), stats);
    assert_eq!(reopened.search(&query, 5).unwrap(), hits);
    assert_eq!(stats.total_vectors, 10);
    assert_eq!(stats.metadata_count, 10);
    assert_eq!(stats.dimension, Some(3));
    assert!(stats.index_file_exists);
}

#[test]
fn test_search_bounds_and_ordering() {
    let dir = tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), None).unwrap();
    index.add(grid("a.pdf", 7)).unwrap();

    let query = grid("q", 4).pop().unwrap().vector;
    for k in [1, 3, 7, 20] {
        let hits = index.search(&query, k).unwrap();
        assert_eq!(hits.len(), k.min(7));
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        for (i, hit) in hits.iter().enumerate() {
            assert_eq!(hit.rank, i + 1);
        }
    }

    let top = &index.search(&query, 1).unwrap()[0];
    assert_eq!(top.entry.text, "a.pdf#3");
    assert_eq!(top.similarity, 1.0);
}

#[test]
fn test_delete_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(grid("a.pdf", 3)).unwrap();
        index.add(grid("b.pdf", 3)).unwrap();
        assert_eq!(index.delete_by_document("a.pdf").unwrap(), 3);
    }

    let index = VectorIndex::open(dir.path(), None).unwrap();
    let stats = index.stats().unwrap();
    assert_eq!(stats.total_vectors, 3);
    assert_eq!(stats.metadata_count, 3);

    let hits = index.search(&[0.0, 0.0, 1.0], 10).unwrap();
    assert!(hits.iter().all(|h| h.entry.source_document == "b.pdf"));
    assert_eq!(hits[0].entry.text, "b.pdf#0");
    assert_eq!(hits[0].similarity, 1.0);
}

#[test]
fn test_failed_persist_rolls_back() {
    let dir = tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), None).unwrap();
    index.add(grid("a.pdf", 2)).unwrap();
    index.add(grid("c.pdf", 1)).unwrap();
    let before = index.stats().unwrap();

    // A directory squatting on the staging path makes the write fail.
    let blocker = dir.path().join(format!("{INDEX_FILE}.tmp"));
    fs::create_dir(&blocker).unwrap();

    let err = index.add(grid("b.pdf", 2)).unwrap_err();
    assert!(matches!(err, StoreError::Persistence { .. }));
    assert_eq!(index.stats().unwrap(), before);
    assert_eq!(index.documents().unwrap().len(), 2);

    let err = index.delete_by_document("a.pdf").unwrap_err();
    assert!(matches!(err, StoreError::Persistence { .. }));
    assert_eq!(index.stats().unwrap(), before);
    assert_eq!(index.search(&[0.0, 0.0, 1.0], 10).unwrap().len(), 3);

    fs::remove_dir(&blocker).unwrap();
    let reopened = VectorIndex::open(dir.path(), None).unwrap();
    assert_eq!(reopened.stats().unwrap().total_vectors, 3);
    drop(reopened);

    assert_eq!(index.add(grid("b.pdf", 2)).unwrap(), 2);
    assert_eq!(index.stats().unwrap().total_vectors, 5);
}

#[test]
fn test_failed_removal_of_last_document_keeps_files() {
    let dir = tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), None).unwrap();
    index.add(grid("a.txt", 1)).unwrap();

    let blocker = dir.path().join(format!("{CONFIG_FILE}.old"));
    fs::create_dir(&blocker).unwrap();
    fs::write(blocker.join("keep"), b"x").unwrap();

    let err = index.delete_by_document("a.txt").unwrap_err();
    assert!(matches!(err, StoreError::Persistence { .. }));
    assert!(dir.path().join(INDEX_FILE).exists());
    assert_eq!(index.stats().unwrap().total_vectors, 1);

    let err = index.clear().unwrap_err();
    assert!(matches!(err, StoreError::Persistence { .. }));
    assert_eq!(index.documents().unwrap().len(), 1);

    fs::remove_dir_all(&blocker).unwrap();
    let reopened = VectorIndex::open(dir.path(), None).unwrap();
    assert_eq!(reopened.stats().unwrap().total_vectors, 1);
    drop(reopened);

    assert_eq!(index.delete_by_document("a.txt").unwrap(), 1);
    assert!(!dir.path().join(INDEX_FILE).exists());
    assert!(!dir.path().join(METADATA_FILE).exists());
    assert_eq!(index.stats().unwrap().dimension, None);
}

#[test]
fn test_dimension_change_starts_fresh() {
    let dir = tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), Some(3)).unwrap();
        index.add(grid("a.pdf", 4)).unwrap();
    }

    let same = VectorIndex::open(dir.path(), Some(3)).unwrap();
    assert_eq!(same.stats().unwrap().total_vectors, 4);
    drop(same);

    let wider = VectorIndex::open(dir.path(), Some(5)).unwrap();
    let stats = wider.stats().unwrap();
    assert_eq!(stats.total_vectors, 0);
    assert_eq!(stats.dimension, Some(5));
    assert!(!dir.path().join(INDEX_FILE).exists());
}

#[test]
fn test_partial_file_set_is_corrupt() {
    let dir = tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(grid("a.pdf", 2)).unwrap();
    }
    fs::remove_file(dir.path().join(CONFIG_FILE)).unwrap();

    assert!(matches!(
        VectorIndex::open(dir.path(), None),
        Err(StoreError::Corrupt(_))
    ));
}

#[test]
fn test_stray_temporaries_are_discarded_on_open() {
    let dir = tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(grid("a.pdf", 2)).unwrap();
    }
    let stray = dir.path().join(format!("{METADATA_FILE}.tmp"));
    fs::write(&stray, b"partial").unwrap();

    let index = VectorIndex::open(dir.path(), None).unwrap();
    assert!(!stray.exists());
    assert_eq!(index.stats().unwrap().total_vectors, 2);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let dir = tempdir().unwrap();
    let index = Arc::new(VectorIndex::open(dir.path(), Some(3)).unwrap());
    index.add(grid("seed.pdf", 4)).unwrap();

    let writer = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for round in 0..5 {
                index.add(grid(&format!("doc{round}.pdf"), 3)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for _ in 0..20 {
                    let hits = index.search(&[1.0, 0.1, 1.0], 3).unwrap();
                    assert_eq!(hits.len(), 3);
                    let stats = index.stats().unwrap();
                    assert_eq!(stats.total_vectors, stats.metadata_count);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(index.stats().unwrap().total_vectors, 19);
    assert_eq!(index.documents().unwrap().len(), 6);
}
