use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::config::Number;
use crate::error::StoreError;
use crate::flat_index::{DistanceMetric, FlatL2Index};
use crate::storage::IndexFiles;
use crate::vector_entry::{Chunk, EmbeddedChunk, IndexEntry};
use crate::vector_ops::{distance_to_similarity, within_distance_range};

/// Fixed once the first vector arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexConfig {
    pub dimension: usize,
    pub distance_metric: DistanceMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// 1-based
    pub rank: usize,
    pub distance: Number,
    pub similarity: Number,
    pub position: usize,
    pub entry: IndexEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub total_vectors: usize,
    pub dimension: Option<usize>,
    pub metadata_count: usize,
    pub distance_metric: DistanceMetric,
    pub storage_path: PathBuf,
    pub index_file_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub name: String,
    pub chunks: usize,
}

#[derive(Debug, Default)]
struct IndexState {
    config: Option<IndexConfig>,
    flat: FlatL2Index,
    /// Position `i` here is row `i` of `flat`.
    arena: Vec<EmbeddedChunk>,
}

impl IndexState {
    fn sized(dimension: Option<usize>) -> Self {
        match dimension {
            Some(dimension) => Self {
                config: Some(IndexConfig {
                    dimension,
                    distance_metric: DistanceMetric::SquaredL2,
                }),
                flat: FlatL2Index::new(dimension),
                arena: Vec::new(),
            },
            None => Self::default(),
        }
    }

    fn check_alignment(&self) -> Result<(), StoreError> {
        if self.flat.len() != self.arena.len() {
            return Err(StoreError::Misaligned {
                vectors: self.flat.len(),
                metadata: self.arena.len(),
            });
        }
        Ok(())
    }

    fn metadata(&self) -> Vec<&Chunk> {
        self.arena.iter().map(|e| &e.chunk).collect()
    }
}

/// Nearest-neighbor index over embedded chunks, persisted as a unit under one
/// directory. Every vector is kept alongside its metadata so that deleting a
/// document rebuilds the search structure from the rows that remain.
pub struct VectorIndex {
    files: IndexFiles,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// Open (or create) the index stored under `dir`.
    ///
    /// With `expected_dimension` set, an empty index is sized up front and a
    /// persisted index of another width is discarded.
    pub fn open(
        dir: impl Into<PathBuf>,
        expected_dimension: Option<usize>,
    ) -> Result<Self, StoreError> {
        let files = IndexFiles::new(dir);
        let expected_dimension = expected_dimension.filter(|&d| d > 0);
        files.recover()?;

        let state = match files.load()? {
            None => {
                debug!("No persisted index in {}", files.dir().display());
                IndexState::sized(expected_dimension)
            }
            Some(snapshot) => match expected_dimension {
                Some(expected) if expected != snapshot.config.dimension => {
                    warn!(
                        "Persisted index in {} has dimension {}, configured embedder produces {}; starting fresh",
                        files.dir().display(),
                        snapshot.config.dimension,
                        expected
                    );
                    files.remove_all()?;
                    IndexState::sized(Some(expected))
                }
                _ => {
                    let arena = snapshot
                        .metadata
                        .into_iter()
                        .zip(snapshot.index.rows())
                        .map(|(chunk, row)| EmbeddedChunk::new(chunk, row.to_vec()))
                        .collect();
                    IndexState {
                        config: Some(IndexConfig {
                            dimension: snapshot.config.dimension,
                            distance_metric: snapshot.config.distance_metric,
                        }),
                        flat: snapshot.index,
                        arena,
                    }
                }
            },
        };
        state.check_alignment()?;

        info!(
            "Opened vector index at {} with {} entries",
            files.dir().display(),
            state.arena.len()
        );
        Ok(Self {
            files,
            state: RwLock::new(state),
        })
    }

    pub fn storage_path(&self) -> &Path {
        self.files.dir()
    }

    pub fn config(&self) -> Result<Option<IndexConfig>, StoreError> {
        Ok(self.read()?.config)
    }

    /// Append a batch and persist it. All or nothing: on any error the index,
    /// in memory and on disk, is as it was before the call.
    pub fn add(&self, batch: Vec<EmbeddedChunk>) -> Result<usize, StoreError> {
        let Some(first) = batch.first() else {
            return Ok(0);
        };

        let mut state = self.write()?;
        let dimension = match state.config {
            Some(config) => config.dimension,
            None => first.vector.len(),
        };
        if dimension == 0 {
            return Err(StoreError::InvalidVector(
                "embedding has zero width".to_string(),
            ));
        }
        for entry in &batch {
            if entry.vector.len() != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: dimension,
                    actual: entry.vector.len(),
                });
            }
            if !entry.vector.iter().all(|v| v.is_finite()) {
                return Err(StoreError::InvalidVector(format!(
                    "non-finite component in chunk {} of {}",
                    entry.chunk.id,
                    entry.source_document()
                )));
            }
            if !within_distance_range(&entry.vector) {
                return Err(StoreError::InvalidVector(format!(
                    "magnitude of chunk {} of {} is too large to compare",
                    entry.chunk.id,
                    entry.source_document()
                )));
            }
        }

        let added = batch.len();
        let previous_len = state.arena.len();
        let was_unsized = state.config.is_none();
        if was_unsized {
            *state = IndexState::sized(Some(dimension));
        }

        for entry in &batch {
            state.flat.add(&entry.vector);
        }
        state.arena.extend(batch);

        if let Err(e) = self.persist(&state) {
            warn!("Rolling back {} entries after failed persist: {}", added, e);
            if was_unsized {
                *state = IndexState::default();
            } else {
                state.flat.truncate(previous_len);
                state.arena.truncate(previous_len);
            }
            return Err(e);
        }
        state.check_alignment()?;

        debug!("Added {} entries, index now holds {}", added, state.arena.len());
        Ok(added)
    }

    /// The `k` nearest entries to `query`, most similar first.
    pub fn search(&self, query: &[Number], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let state = self.read()?;
        let Some(config) = state.config else {
            return Ok(Vec::new());
        };
        if k == 0 || state.arena.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != config.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: config.dimension,
                actual: query.len(),
            });
        }
        if !within_distance_range(query) {
            return Err(StoreError::InvalidVector(
                "query is non-finite or too large to compare".to_string(),
            ));
        }

        let hits = state
            .flat
            .search(query, k)
            .into_iter()
            .enumerate()
            .map(|(i, neighbor)| SearchHit {
                rank: i + 1,
                distance: neighbor.distance,
                similarity: distance_to_similarity(neighbor.distance),
                position: neighbor.position,
                entry: state.arena[neighbor.position].chunk.clone(),
            })
            .collect();
        Ok(hits)
    }

    /// Remove every entry derived from `source_document`, vectors included.
    pub fn delete_by_document(&self, source_document: &str) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let removed = state
            .arena
            .iter()
            .filter(|e| e.source_document() == source_document)
            .count();
        if removed == 0 {
            return Ok(0);
        }

        let survivors: Vec<EmbeddedChunk> = state
            .arena
            .iter()
            .filter(|e| e.source_document() != source_document)
            .cloned()
            .collect();

        if survivors.is_empty() {
            self.files.remove_all()?;
            *state = IndexState::default();
            info!(
                "Deleted {} entries for {}; index is now empty",
                removed, source_document
            );
            return Ok(removed);
        }

        let config = state.config.ok_or_else(|| {
            StoreError::Corrupt("populated index has no configuration".to_string())
        })?;
        let rebuilt = IndexState {
            config: Some(config),
            flat: FlatL2Index::from_rows(
                config.dimension,
                survivors.iter().map(|e| e.vector.as_slice()),
            ),
            arena: survivors,
        };
        rebuilt.check_alignment()?;
        self.persist(&rebuilt)?;
        *state = rebuilt;

        info!(
            "Deleted {} entries for {}, {} remain",
            removed,
            source_document,
            state.arena.len()
        );
        Ok(removed)
    }

    pub fn stats(&self) -> Result<IndexStats, StoreError> {
        let state = self.read()?;
        state.check_alignment()?;
        Ok(IndexStats {
            total_vectors: state.flat.len(),
            dimension: state.config.map(|c| c.dimension),
            metadata_count: state.arena.len(),
            distance_metric: state
                .config
                .map(|c| c.distance_metric)
                .unwrap_or(DistanceMetric::SquaredL2),
            storage_path: self.files.dir().to_path_buf(),
            index_file_exists: self.files.index_exists(),
        })
    }

    /// Drop everything, on disk and in memory.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.write()?;
        self.files.remove_all()?;
        *state = IndexState::default();
        info!("Cleared vector index at {}", self.files.dir().display());
        Ok(())
    }

    /// Indexed documents with their chunk counts, in the order they were added.
    pub fn documents(&self) -> Result<Vec<DocumentSummary>, StoreError> {
        let state = self.read()?;
        let mut summaries: Vec<DocumentSummary> = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for entry in &state.arena {
            match seen.get(entry.source_document()) {
                Some(&slot) => summaries[slot].chunks += 1,
                None => {
                    seen.insert(entry.source_document(), summaries.len());
                    summaries.push(DocumentSummary {
                        name: entry.source_document().to_string(),
                        chunks: 1,
                    });
                }
            }
        }
        Ok(summaries)
    }

    fn persist(&self, state: &IndexState) -> Result<(), StoreError> {
        let metric = state
            .config
            .map(|c| c.distance_metric)
            .unwrap_or(DistanceMetric::SquaredL2);
        self.files.commit(&state.flat, &state.metadata(), metric)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>, StoreError> {
        self.state.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>, StoreError> {
        self.state.write().map_err(|_| StoreError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_entry::{DocumentInfo, FileType, StructuralCount};
    use tempfile::tempdir;

    fn embedded(doc: &str, id: usize, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk::new(
            Chunk {
                id,
                source_document: doc.to_string(),
                text: format!("{doc} chunk {id}"),
                start_offset: 0,
                end_offset: 10,
                sequence_index: id,
                token_count: 3,
                document: DocumentInfo {
                    file_name: doc.to_string(),
                    file_type: FileType::Text,
                    structural_count: StructuralCount::Paragraphs(1),
                },
            },
            vector,
        )
    }

    #[test]
    fn test_add_empty_batch_is_noop() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        assert_eq!(index.add(Vec::new()).unwrap(), 0);
        assert!(!index.stats().unwrap().index_file_exists);
        assert_eq!(index.stats().unwrap().dimension, None);
    }

    #[test]
    fn test_unsized_index_takes_first_width() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index
            .add(vec![embedded("a.txt", 0, vec![1.0, 2.0, 3.0])])
            .unwrap();
        assert_eq!(index.stats().unwrap().dimension, Some(3));

        let err = index
            .add(vec![embedded("a.txt", 1, vec![1.0, 2.0])])
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(index.stats().unwrap().total_vectors, 1);
    }

    #[test]
    fn test_mixed_batch_rejected_whole() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), Some(2)).unwrap();
        let err = index
            .add(vec![
                embedded("a.txt", 0, vec![1.0, 0.0]),
                embedded("a.txt", 1, vec![1.0, 0.0, 0.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        assert_eq!(index.stats().unwrap().total_vectors, 0);
    }

    #[test]
    fn test_non_finite_vector_rejected() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        let err = index
            .add(vec![embedded("a.txt", 0, vec![f32::NAN, 0.0])])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidVector(_)));
    }

    #[test]
    fn test_oversized_vectors_rejected() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        let err = index
            .add(vec![embedded("a.txt", 0, vec![1e20, 0.0])])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidVector(_)));
        assert_eq!(index.stats().unwrap().total_vectors, 0);

        index.add(vec![embedded("a.txt", 0, vec![1e15, 0.0])]).unwrap();
        assert!(matches!(
            index.search(&[-1e20, 0.0], 1),
            Err(StoreError::InvalidVector(_))
        ));
        let hits = index.search(&[-1e15, 0.0], 1).unwrap();
        assert!(hits[0].similarity > 0.0 && hits[0].similarity <= 1.0);
    }

    #[test]
    fn test_search_exact_match_ranks_first() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index
            .add(vec![
                embedded("a.txt", 0, vec![1.0, 0.0]),
                embedded("a.txt", 1, vec![0.0, 1.0]),
                embedded("b.txt", 0, vec![0.5, 0.5]),
            ])
            .unwrap();

        let hits = index.search(&[0.0, 1.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rank, 1);
        assert_eq!(hits[0].similarity, 1.0);
        assert_eq!(hits[0].entry.text, "a.txt chunk 1");
        assert_eq!(hits[1].entry.source_document, "b.txt");
        assert!((hits[1].similarity - 1.0 / 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_search_wrong_width_and_empty() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), Some(2)).unwrap();
        assert!(index.search(&[1.0, 0.0], 3).unwrap().is_empty());

        index.add(vec![embedded("a.txt", 0, vec![1.0, 0.0])]).unwrap();
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
        assert!(matches!(
            index.search(&[1.0], 3),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_delete_unknown_document_changes_nothing() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(vec![embedded("a.txt", 0, vec![1.0, 0.0])]).unwrap();
        let before = index.stats().unwrap();

        assert_eq!(index.delete_by_document("missing.pdf").unwrap(), 0);
        assert_eq!(index.stats().unwrap(), before);
    }

    #[test]
    fn test_delete_removes_vectors_from_search() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index
            .add(vec![
                embedded("a.txt", 0, vec![1.0, 0.0]),
                embedded("b.txt", 0, vec![0.0, 1.0]),
                embedded("a.txt", 1, vec![0.9, 0.1]),
            ])
            .unwrap();

        assert_eq!(index.delete_by_document("a.txt").unwrap(), 2);

        let hits = index.search(&[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.source_document, "b.txt");
        assert_eq!(hits[0].position, 0);

        let stats = index.stats().unwrap();
        assert_eq!(stats.total_vectors, 1);
        assert_eq!(stats.metadata_count, 1);
    }

    #[test]
    fn test_delete_last_document_unsizes_index() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(vec![embedded("a.txt", 0, vec![1.0, 0.0])]).unwrap();

        assert_eq!(index.delete_by_document("a.txt").unwrap(), 1);
        let stats = index.stats().unwrap();
        assert_eq!(stats.total_vectors, 0);
        assert_eq!(stats.dimension, None);
        assert!(!stats.index_file_exists);

        index
            .add(vec![embedded("c.txt", 0, vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        assert_eq!(index.stats().unwrap().dimension, Some(4));
    }

    #[test]
    fn test_documents_in_insertion_order() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index
            .add(vec![
                embedded("z.txt", 0, vec![1.0]),
                embedded("a.txt", 0, vec![2.0]),
                embedded("z.txt", 1, vec![3.0]),
            ])
            .unwrap();

        let docs = index.documents().unwrap();
        assert_eq!(
            docs,
            vec![
                DocumentSummary {
                    name: "z.txt".to_string(),
                    chunks: 2
                },
                DocumentSummary {
                    name: "a.txt".to_string(),
                    chunks: 1
                },
            ]
        );
    }

    #[test]
    fn test_clear_resets() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::open(dir.path(), None).unwrap();
        index.add(vec![embedded("a.txt", 0, vec![1.0, 0.0])]).unwrap();
        index.clear().unwrap();

        let stats = index.stats().unwrap();
        assert_eq!(stats.total_vectors, 0);
        assert!(!stats.index_file_exists);
        assert!(index.documents().unwrap().is_empty());
    }
}
