//! Retrieval core for document question answering: extract text from
//! uploaded documents, chunk it, embed the chunks, keep them in a persistent
//! nearest-neighbor index and retrieve the best matches for a question.

pub mod chunker;
pub mod config;
pub mod database;
pub mod embedder;
pub mod error;
pub mod extract;
pub mod flat_index;
pub mod pipeline;
pub mod retriever;
pub mod storage;
pub mod vector_entry;
pub mod vector_ops;

pub use chunker::{ChunkConfig, Chunker};
pub use config::Settings;
pub use database::{DocumentSummary, IndexConfig, IndexStats, SearchHit, VectorIndex};
pub use embedder::{create_embedder, embed_chunks, Embedder, HashingEmbedder};
pub use error::{ChunkError, EmbedError, Error, ExtractError, Result, StoreError};
pub use extract::{extract_document, extract_path, ExtractedDocument};
pub use flat_index::DistanceMetric;
pub use pipeline::{
    DocumentProcessor, Ingestor, JobId, JobRecord, JobStatus, LogStatusSink, StagedUpload,
    StatusBoard, StatusSink,
};
pub use retriever::{build_context, RetrievedChunk, Retriever};
pub use vector_entry::{Chunk, DocumentInfo, EmbeddedChunk, FileType, IndexEntry, StructuralCount};
