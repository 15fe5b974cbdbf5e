use crate::config::Number;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FileType {
    Pdf,
    Docx,
    Text,
}

impl FileType {
    /// Resolve the format from a file name's extension, ignoring case.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "txt" => Some(FileType::Text),
            _ => None,
        }
    }

    pub fn is_supported(name: &str) -> bool {
        Self::from_file_name(name).is_some()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Text => "txt",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format-specific structure count recorded at extraction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum StructuralCount {
    Pages(usize),
    Paragraphs(usize),
}

/// Document-level metadata attached to every chunk derived from it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DocumentInfo {
    pub file_name: String,
    pub file_type: FileType,
    pub structural_count: StructuralCount,
}

/// A bounded slice of a document's text. Offsets count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Chunk {
    pub id: usize,
    pub source_document: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub sequence_index: usize,
    pub token_count: usize,
    pub document: DocumentInfo,
}

/// The metadata half of an index slot.
pub type IndexEntry = Chunk;

/// A chunk together with its embedding. The index arena keeps these whole so
/// the vector survives for rebuilds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<Number>,
}

impl EmbeddedChunk {
    pub fn new(chunk: Chunk, vector: Vec<Number>) -> Self {
        Self { chunk, vector }
    }

    pub fn source_document(&self) -> &str {
        &self.chunk.source_document
    }
}
