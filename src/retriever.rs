//! Query-time retrieval: embed the question, search the index, hand back
//! ranked chunks with their provenance.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Number;
use crate::database::VectorIndex;
use crate::embedder::Embedder;

const PREVIEW_CHARS: usize = 200;

/// Answer text a generation layer can show when nothing was retrieved.
pub const NO_RESULTS_ANSWER: &str =
    "I couldn't find any relevant information in the uploaded documents to answer your question.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub similarity_score: Number,
    pub source_document: String,
    pub sequence_index: usize,
    pub rank: usize,
}

impl RetrievedChunk {
    /// At most 200 characters of the chunk text, with `...` appended when cut.
    pub fn preview(&self) -> String {
        let mut chars = self.text.chars();
        let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    min_similarity: Number,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            min_similarity: 0.0,
        }
    }

    /// Drop hits scoring below `threshold`. `0.0` keeps everything.
    pub fn min_similarity(mut self, threshold: Number) -> Self {
        self.min_similarity = threshold;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// The `k` chunks most relevant to `question`. Never fails: a blank
    /// question, an empty index or any embedding or search error yields an
    /// empty list.
    pub fn answer_query(&self, question: &str, k: usize) -> Vec<RetrievedChunk> {
        let question = question.trim();
        if question.is_empty() || k == 0 {
            return Vec::new();
        }

        let query = match self.embedder.encode_one(question) {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Could not embed query: {}", e);
                return Vec::new();
            }
        };

        let hits = match self.index.search(&query, k) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Search failed: {}", e);
                return Vec::new();
            }
        };

        let results: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|hit| hit.similarity >= self.min_similarity)
            .map(|hit| RetrievedChunk {
                text: hit.entry.text,
                similarity_score: hit.similarity,
                source_document: hit.entry.source_document,
                sequence_index: hit.entry.sequence_index,
                rank: hit.rank,
            })
            .collect();

        debug!("Query matched {} chunks (k = {})", results.len(), k);
        results
    }
}

/// Retrieved texts in rank order separated by blank lines.
pub fn build_context(results: &[RetrievedChunk]) -> String {
    let mut ordered: Vec<&RetrievedChunk> = results.iter().collect();
    ordered.sort_by_key(|r| r.rank);
    ordered
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
