//! Turn raw document bytes into plain text plus document metadata.
//!
//! The declared file name's extension picks the format. Unsupported
//! extensions are rejected before any bytes are parsed.

mod docx;
mod pdf;
mod text;

use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::ExtractError;
use crate::vector_entry::{DocumentInfo, FileType, StructuralCount};

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    pub text: String,
    pub info: DocumentInfo,
}

/// What is known about a file on disk before it is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub extension: String,
    pub supported: bool,
}

pub fn extract_document(bytes: &[u8], file_name: &str) -> Result<ExtractedDocument, ExtractError> {
    let file_type = FileType::from_file_name(file_name)
        .ok_or_else(|| ExtractError::UnsupportedFormat(extension_of(file_name)))?;

    let (text, structural_count) = match file_type {
        FileType::Pdf => {
            let pages = pdf::extract_pages(bytes).map_err(|reason| failed(file_name, reason))?;
            let count = pages.len();
            (pages.join("\n"), StructuralCount::Pages(count))
        }
        FileType::Docx => {
            let paragraphs =
                docx::extract_paragraphs(bytes).map_err(|reason| failed(file_name, reason))?;
            let count = paragraphs.len();
            (paragraphs.join("\n"), StructuralCount::Paragraphs(count))
        }
        FileType::Text => {
            let text = text::decode(bytes);
            let count = text::count_paragraphs(&text);
            (text, StructuralCount::Paragraphs(count))
        }
    };

    debug!(
        "Extracted {} chars from {} ({:?})",
        text.chars().count(),
        file_name,
        structural_count
    );

    Ok(ExtractedDocument {
        text,
        info: DocumentInfo {
            file_name: file_name.to_string(),
            file_type,
            structural_count,
        },
    })
}

/// Read `path` and extract it under its own file name.
pub fn extract_path(path: &Path) -> Result<ExtractedDocument, ExtractError> {
    let file_name = display_name(path);
    if !FileType::is_supported(&file_name) {
        return Err(ExtractError::UnsupportedFormat(extension_of(&file_name)));
    }
    let bytes = fs::read(path)?;
    extract_document(&bytes, &file_name)
}

pub fn file_info(path: &Path) -> Result<FileInfo, ExtractError> {
    let name = display_name(path);
    let size = fs::metadata(path)?.len();
    Ok(FileInfo {
        extension: extension_of(&name),
        supported: FileType::is_supported(&name),
        name,
        size,
    })
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn failed(file_name: &str, reason: String) -> ExtractError {
    ExtractError::Failed {
        file: file_name.to_string(),
        reason,
    }
}
