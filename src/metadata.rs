use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Result, registry::LoaderSpec};

/// Per-file attributes carried by every raw document and every chunk cut
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Absolute path with symlinks resolved.
    pub file_path: PathBuf,
    pub file_name: String,
    /// Lowercase extension without the dot.
    pub file_type: String,
    /// blake3 of the file bytes, hex encoded.
    pub content_hash: String,
    /// Not every filesystem records a creation time.
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
    pub document_type: String,
    /// Set by the splitter; absent on raw documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
}

impl DocumentMetadata {
    /// String value of a metadata field, for equality filters.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "file_path" => Some(self.file_path.to_string_lossy().into_owned()),
            "file_name" => Some(self.file_name.clone()),
            "file_type" => Some(self.file_type.clone()),
            "content_hash" => Some(self.content_hash.clone()),
            "document_type" => Some(self.document_type.clone()),
            "created_at" => self.created_at.map(|t| t.to_rfc3339()),
            "modified_at" => Some(self.modified_at.to_rfc3339()),
            "chunk_index" => self.chunk_index.map(|i| i.to_string()),
            _ => None,
        }
    }

    pub fn with_chunk_index(&self, index: usize) -> Self {
        Self {
            chunk_index: Some(index),
            ..self.clone()
        }
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Derive metadata for a file whose bytes have already been read.
pub fn extract(
    path: &Path,
    bytes: &[u8],
    spec: &LoaderSpec,
) -> Result<DocumentMetadata> {
    let file_path = path.canonicalize()?;
    let fs_meta = std::fs::metadata(&file_path)?;

    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_type = file_path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    Ok(DocumentMetadata {
        file_path,
        file_name,
        file_type,
        content_hash: content_hash(bytes),
        created_at: fs_meta.created().ok().map(to_utc),
        modified_at: to_utc(fs_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        document_type: spec.document_type.as_str().to_string(),
        chunk_index: None,
    })
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
