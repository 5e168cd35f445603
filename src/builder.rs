//! Turning raw documents into a persisted collection.

use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::Utc;
use kdam::{BarExt, tqdm};

use crate::{
    cancel::CancelToken,
    chunking::{Chunk, ChunkSplitter},
    config_db::ConfigDb,
    data_dir::{DataDir, validate_collection_name},
    doc_id::RecordId,
    embedding::{Embedder, batch_size_for, normalize},
    error::{Error, Result},
    loader_pool::{LoadReport, LoaderPool},
    loaders::RawDocument,
    lock::CollectionLock,
    settings::Settings,
    vector_index::{CollectionManifest, METRIC, VectorIndex, VectorRecord},
};

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    pub collection: String,
    pub model_id: String,
    pub documents: usize,
    pub chunks: usize,
    pub dimension: usize,
    pub batch_size: usize,
    pub elapsed: Duration,
}

/// Writes collections. One builder can build any number of collections,
/// one at a time.
pub struct IndexBuilder<'a> {
    data_dir: &'a DataDir,
    config_db: &'a ConfigDb,
    settings: &'a Settings,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(
        data_dir: &'a DataDir,
        config_db: &'a ConfigDb,
        settings: &'a Settings,
    ) -> Self {
        Self {
            data_dir,
            config_db,
            settings,
        }
    }

    /// Load every file under `source` with `pool`, then build `collection`
    /// from the result.
    pub fn build_from_directory(
        &self,
        collection: &str,
        source: &Path,
        pool: &LoaderPool<'_>,
        embedder: &mut dyn Embedder,
        cancel: &CancelToken,
    ) -> Result<(LoadReport, BuildSummary)> {
        validate_collection_name(collection)?;
        let report = pool.load_directory(source, cancel)?;
        cancel.check()?;
        let summary = self.build(collection, &report.documents, embedder, cancel)?;
        Ok((report, summary))
    }

    /// Split, embed and persist `documents` as the complete contents of
    /// `collection`, replacing any previous build.
    ///
    /// The embedding model is released before returning, whether the build
    /// succeeded or not.
    pub fn build(
        &self,
        collection: &str,
        documents: &[RawDocument],
        embedder: &mut dyn Embedder,
        cancel: &CancelToken,
    ) -> Result<BuildSummary> {
        let result = validate_collection_name(collection).and_then(|()| {
            let lock_path = self.data_dir.lock_file(collection)?;
            let _lock = CollectionLock::acquire(&lock_path, collection)?;
            self.build_locked(collection, documents, embedder, cancel)
        });
        embedder.release();
        result
    }

    fn build_locked(
        &self,
        collection: &str,
        documents: &[RawDocument],
        embedder: &mut dyn Embedder,
        cancel: &CancelToken,
    ) -> Result<BuildSummary> {
        let started = Instant::now();
        let splitter = ChunkSplitter::from_settings(self.settings)?;
        let chunks = splitter.split_documents(documents);
        tracing::info!(
            collection,
            documents = documents.len(),
            chunks = chunks.len(),
            "split documents"
        );

        let batch_size = batch_size_for(
            embedder.model_id(),
            self.settings.compute_device_build,
        );
        let dimension = embedder.dimension()?;
        let vectors = self.embed_chunks(&chunks, embedder, batch_size, dimension, cancel)?;

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| VectorRecord {
                id: RecordId::new(&chunk.metadata.content_hash, chunk.index())
                    .numeric,
                embedding,
                text: chunk.text,
                metadata: chunk.metadata,
            })
            .collect();

        let manifest = CollectionManifest {
            name: collection.to_string(),
            model_id: embedder.model_id().to_string(),
            dimension,
            metric: METRIC.to_string(),
            chunk_size: splitter.chunk_size(),
            chunk_overlap: splitter.chunk_overlap(),
            document_count: documents.len(),
            record_count: records.len(),
            built_at: Utc::now(),
        };

        // Everything that can fail on bad input happens before the new
        // index replaces the old one.
        let audit_dir = self.data_dir.audit_dir(collection);
        let staged_audit = stage_audit(&audit_dir, documents)?;
        VectorIndex::write(
            &self.data_dir.index_file(collection),
            &manifest,
            &records,
        )?;
        self.config_db.set_collection(&manifest)?;
        publish_audit(&staged_audit, &audit_dir)?;

        let summary = BuildSummary {
            collection: collection.to_string(),
            model_id: manifest.model_id,
            documents: documents.len(),
            chunks: records.len(),
            dimension,
            batch_size,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            collection,
            chunks = summary.chunks,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "collection built"
        );
        Ok(summary)
    }

    fn embed_chunks(
        &self,
        chunks: &[Chunk],
        embedder: &mut dyn Embedder,
        batch_size: usize,
        dimension: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<f32>>> {
        let show = self.settings.show_progress && std::io::stderr().is_terminal();
        let mut progress = tqdm!(
            total = chunks.len(),
            desc = "Embedding",
            disable = !show
        );

        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size.max(1)) {
            cancel.check()?;

            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = embedder.embed_documents(&texts, batch_size)?;
            if embedded.len() != texts.len() {
                return Err(Error::Embedding(format!(
                    "model returned {} vectors for {} texts",
                    embedded.len(),
                    texts.len()
                )));
            }

            for mut vector in embedded {
                if vector.len() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                normalize(&mut vector);
                vectors.push(vector);
            }
            progress.update(batch.len())?;
        }

        if show {
            eprintln!();
        }
        Ok(vectors)
    }

    /// Delete a collection's files and registry entry.
    pub fn remove(&self, collection: &str) -> Result<()> {
        validate_collection_name(collection)?;
        let lock_path = self.data_dir.lock_file(collection)?;
        let _lock = CollectionLock::acquire(&lock_path, collection)?;

        let registered = self.config_db.remove_collection(collection)?;
        let dir = self.data_dir.collection_dir(collection);
        let on_disk = dir.exists();
        if on_disk {
            std::fs::remove_dir_all(&dir)?;
        }

        if !registered && !on_disk {
            return Err(Error::NotFound {
                kind: "collection",
                name: collection.to_string(),
            });
        }
        tracing::info!(collection, "collection removed");
        Ok(())
    }
}

impl std::fmt::Debug for IndexBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("data_dir", &self.data_dir.root())
            .finish_non_exhaustive()
    }
}

/// Write one `{content_hash}.json` per raw document into a staging
/// directory next to `dir`.
fn stage_audit(dir: &Path, documents: &[RawDocument]) -> Result<PathBuf> {
    let mut staging = dir.as_os_str().to_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    for doc in documents {
        let path = staging.join(format!("{}.json", doc.metadata.content_hash));
        std::fs::write(&path, serde_json::to_vec_pretty(doc)?)?;
    }
    Ok(staging)
}

/// Replace the audit directory as a whole with a staged one.
fn publish_audit(staging: &Path, dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::rename(staging, dir)?;
    Ok(())
}
