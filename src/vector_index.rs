//! Persistent flat vector index, one redb file per collection.
//!
//! Layout of `index.redb`:
//! - `vectors`: record id -> 4 byte dimension (u32 LE) followed by the f32
//!   LE components
//! - `payloads`: record id -> JSON `{text, metadata}`
//! - `manifest`: the single key `manifest` -> JSON [`CollectionManifest`]
//!
//! An index is written once, in full, to a temporary file that is then
//! renamed over the previous one. Readers load every record into memory
//! and release the file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{
    doc_id::RecordId,
    embedding::{euclidean_distance, relevance_score},
    error::{Error, Result},
    metadata::DocumentMetadata,
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const PAYLOADS: TableDefinition<u64, &str> = TableDefinition::new("payloads");
const MANIFEST: TableDefinition<&str, &str> = TableDefinition::new("manifest");

const MANIFEST_KEY: &str = "manifest";
const HEADER_SIZE: usize = 4;

pub const METRIC: &str = "euclidean";

/// Describes how a collection was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub name: String,
    pub model_id: String,
    pub dimension: usize,
    pub metric: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub document_count: usize,
    pub record_count: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: u64,
    /// Unit length.
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl VectorRecord {
    pub fn record_id(&self) -> RecordId {
        RecordId::from_numeric(self.id)
    }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    text: String,
    metadata: DocumentMetadata,
}

/// Exact-match restriction on one metadata field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFilter {
    pub field: String,
    pub value: String,
}

impl MetadataFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        metadata
            .field(&self.field)
            .is_some_and(|v| v == self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit<'a> {
    pub record: &'a VectorRecord,
    pub score: f32,
}

/// An index loaded into memory.
pub struct VectorIndex {
    manifest: CollectionManifest,
    records: Vec<VectorRecord>,
}

impl VectorIndex {
    /// Write `records` as the complete contents of the index at `path`,
    /// replacing any previous index.
    ///
    /// Every embedding must have `manifest.dimension` components.
    pub fn write(
        path: &Path,
        manifest: &CollectionManifest,
        records: &[VectorRecord],
    ) -> Result<()> {
        if let Some(bad) = records
            .iter()
            .find(|r| r.embedding.len() != manifest.dimension)
        {
            return Err(Error::DimensionMismatch {
                expected: manifest.dimension,
                actual: bad.embedding.len(),
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = temporary_path(path);
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }

        let dimension = u32::try_from(manifest.dimension).map_err(|_| {
            Error::Config(format!("dimension {} too large", manifest.dimension))
        })?;

        {
            let db = Database::create(&tmp)?;
            let txn = db.begin_write()?;
            {
                let mut vectors = txn.open_table(VECTORS)?;
                let mut payloads = txn.open_table(PAYLOADS)?;
                for record in records {
                    let byte_len = HEADER_SIZE
                        + std::mem::size_of_val(record.embedding.as_slice());
                    let mut guard =
                        vectors.insert_reserve(record.id, byte_len)?;
                    let dest = guard.as_mut();
                    dest[0..HEADER_SIZE]
                        .copy_from_slice(&dimension.to_le_bytes());
                    for (slot, value) in dest[HEADER_SIZE..]
                        .chunks_exact_mut(4)
                        .zip(&record.embedding)
                    {
                        slot.copy_from_slice(&value.to_le_bytes());
                    }
                    drop(guard);

                    let payload = serde_json::to_string(&Payload {
                        text: record.text.clone(),
                        metadata: record.metadata.clone(),
                    })?;
                    payloads.insert(record.id, payload.as_str())?;
                }

                let mut table = txn.open_table(MANIFEST)?;
                let encoded = serde_json::to_string(manifest)?;
                table.insert(MANIFEST_KEY, encoded.as_str())?;
            }
            txn.commit()?;
        }

        std::fs::rename(&tmp, path)?;
        tracing::debug!(
            path = %path.display(),
            records = records.len(),
            "wrote vector index"
        );
        Ok(())
    }

    /// Read only the manifest of the index at `path`.
    pub fn read_manifest(
        path: &Path,
        collection: &str,
    ) -> Result<CollectionManifest> {
        let db = open_existing(path, collection)?;
        let txn = db.begin_read()?;
        read_manifest_table(&txn, path)
    }

    /// Load the index of `collection` stored at `path`.
    pub fn open(path: &Path, collection: &str) -> Result<Self> {
        let db = open_existing(path, collection)?;
        let txn = db.begin_read()?;
        let manifest = read_manifest_table(&txn, path)?;

        let payloads = txn.open_table(PAYLOADS)?;
        let vectors = txn.open_table(VECTORS)?;
        let mut records = Vec::with_capacity(manifest.record_count);
        for entry in vectors.iter()? {
            let (key, value) = entry?;
            let id = key.value();
            let embedding = decode_vector(path, id, value.value())?;
            if embedding.len() != manifest.dimension {
                return Err(Error::DimensionMismatch {
                    expected: manifest.dimension,
                    actual: embedding.len(),
                });
            }

            let payload = payloads.get(id)?.ok_or_else(|| {
                Error::malformed(path, format!("record {id:016x} has no payload"))
            })?;
            let Payload { text, metadata } =
                serde_json::from_str(payload.value())?;

            records.push(VectorRecord {
                id,
                embedding,
                text,
                metadata,
            });
        }

        Ok(Self { manifest, records })
    }

    pub fn manifest(&self) -> &CollectionManifest {
        &self.manifest
    }

    pub fn records(&self) -> &[VectorRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Exhaustive nearest-neighbour search.
    ///
    /// Candidates are restricted by `filter` first, then scored, then cut
    /// at `threshold`, then truncated to `k`. Equal scores are ordered by
    /// record id.
    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Hit<'_>>> {
        if query.len() != self.manifest.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.manifest.dimension,
                actual: query.len(),
            });
        }

        let mut hits: Vec<Hit<'_>> = self
            .records
            .iter()
            .filter(|r| filter.is_none_or(|f| f.matches(&r.metadata)))
            .map(|record| Hit {
                record,
                score: relevance_score(euclidean_distance(
                    query,
                    &record.embedding,
                )),
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("collection", &self.manifest.name)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

fn open_existing(path: &Path, collection: &str) -> Result<Database> {
    if !path.is_file() {
        return Err(Error::IndexNotFound {
            collection: collection.to_string(),
        });
    }
    Ok(Database::open(path)?)
}

fn read_manifest_table(
    txn: &redb::ReadTransaction,
    path: &Path,
) -> Result<CollectionManifest> {
    let table = txn.open_table(MANIFEST)?;
    let guard = table
        .get(MANIFEST_KEY)?
        .ok_or_else(|| Error::malformed(path, "index has no manifest"))?;
    Ok(serde_json::from_str(guard.value())?)
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn decode_vector(path: &Path, id: u64, bytes: &[u8]) -> Result<Vec<f32>> {
    let corrupt =
        || Error::malformed(path, format!("corrupt vector for record {id:016x}"));

    let header: [u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(corrupt)?;
    let dimension = u32::from_le_bytes(header) as usize;

    let body = &bytes[HEADER_SIZE..];
    if body.len() != dimension * 4 {
        return Err(corrupt());
    }

    // redb values are not guaranteed to be 4-byte aligned.
    Ok(body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
