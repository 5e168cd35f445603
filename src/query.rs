//! Ranked retrieval over a built collection.

use std::time::Duration;

use serde::Serialize;

use crate::{
    data_dir::{DataDir, validate_collection_name},
    doc_id::RecordId,
    embedding::{Embedder, normalize},
    error::{Error, Result},
    lock::CollectionLock,
    metadata::DocumentMetadata,
    model_manager::ModelManager,
    settings::{ComputeDevice, Settings},
    vector_index::{CollectionManifest, MetadataFilter, VectorIndex},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    #[serde(serialize_with = "serialize_record_id")]
    pub id: RecordId,
    pub score: f32,
    pub text: String,
    pub metadata: DocumentMetadata,
}

fn serialize_record_id<S: serde::Serializer>(
    id: &RecordId,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&id.short)
}

/// Per-query knobs, normally taken from [`Settings`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub k: usize,
    pub score_threshold: f32,
    pub document_type: Option<String>,
    pub search_term: Option<String>,
}

impl QueryOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            k: settings.k,
            score_threshold: settings.score_threshold,
            document_type: settings.document_type_filter.clone(),
            search_term: settings.search_term_filter.clone(),
        }
    }
}

/// What the loaded state was built for. Asking for anything else makes
/// the engine reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineKey {
    pub collection: String,
    pub device: ComputeDevice,
    pub model_id: String,
}

struct Loaded {
    key: EngineKey,
    index: VectorIndex,
    model: Box<dyn Embedder>,
}

type ModelFactory = Box<dyn Fn(&CollectionManifest) -> Box<dyn Embedder>>;

/// Holds at most one collection and its embedding model in memory.
pub struct QueryEngine<'a> {
    data_dir: &'a DataDir,
    settings: &'a Settings,
    make_model: ModelFactory,
    loaded: Option<Loaded>,
}

impl<'a> QueryEngine<'a> {
    pub fn new(data_dir: &'a DataDir, settings: &'a Settings) -> Self {
        let device = settings.compute_device_query;
        let cache_dir = data_dir.models_dir().ok();
        Self::with_model_factory(
            data_dir,
            settings,
            Box::new(move |manifest: &CollectionManifest| {
                let mut manager =
                    ModelManager::with_model_id(&manifest.model_id, device);
                if let Some(dir) = &cache_dir {
                    manager = manager.with_cache_dir(dir.clone());
                }
                Box::new(manager) as Box<dyn Embedder>
            }),
        )
    }

    /// Use `make_model` to create the embedder for a collection instead of
    /// a [`ModelManager`] for its recorded model.
    pub fn with_model_factory(
        data_dir: &'a DataDir,
        settings: &'a Settings,
        make_model: ModelFactory,
    ) -> Self {
        Self {
            data_dir,
            settings,
            make_model,
            loaded: None,
        }
    }

    pub fn key(&self) -> Option<&EngineKey> {
        self.loaded.as_ref().map(|l| &l.key)
    }

    pub fn manifest(&self) -> Option<&CollectionManifest> {
        self.loaded.as_ref().map(|l| l.index.manifest())
    }

    /// Make `collection` the loaded one.
    ///
    /// Waits for a running build of the collection to finish. Same key as
    /// the loaded state is a no-op, except that an index rebuilt since it
    /// was loaded is read again.
    pub fn switch_to(&mut self, collection: &str) -> Result<()> {
        validate_collection_name(collection)?;
        CollectionLock::wait_until_free(
            &self.data_dir.lock_file(collection)?,
            collection,
            Duration::from_millis(self.settings.lock_wait_ms),
        )?;

        let path = self.data_dir.index_file(collection);
        let manifest = VectorIndex::read_manifest(&path, collection)?;
        let key = EngineKey {
            collection: collection.to_string(),
            device: self.settings.compute_device_query,
            model_id: manifest.model_id.clone(),
        };

        if let Some(loaded) = self.loaded.as_mut()
            && loaded.key == key
        {
            if loaded.index.manifest().built_at != manifest.built_at {
                tracing::debug!(collection, "collection was rebuilt, reloading");
                loaded.index = VectorIndex::open(&path, collection)?;
            }
            return Ok(());
        }

        self.release();
        let index = VectorIndex::open(&path, collection)?;
        let model = (self.make_model)(index.manifest());
        tracing::info!(
            collection,
            model = %key.model_id,
            records = index.len(),
            "loaded collection"
        );
        self.loaded = Some(Loaded { key, index, model });
        Ok(())
    }

    /// Search `collection` with the options from settings.
    pub fn query(
        &mut self,
        collection: &str,
        text: &str,
    ) -> Result<Vec<QueryResult>> {
        let options = QueryOptions::from_settings(self.settings);
        self.query_with(collection, text, &options)
    }

    /// Search `collection`.
    ///
    /// Candidates are restricted by document type, ranked by relevance,
    /// cut at the score threshold and at `k`. The search term filter is
    /// applied last, so fewer than `k` results may come back.
    pub fn query_with(
        &mut self,
        collection: &str,
        text: &str,
        options: &QueryOptions,
    ) -> Result<Vec<QueryResult>> {
        self.switch_to(collection)?;
        let loaded = self.loaded.as_mut().ok_or_else(|| Error::IndexNotFound {
            collection: collection.to_string(),
        })?;

        let expected = loaded.index.manifest().dimension;
        let mut query = loaded.model.embed_query(text)?;
        if query.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }
        normalize(&mut query);

        let filter = options
            .document_type
            .as_deref()
            .map(|t| MetadataFilter::new("document_type", t));
        let hits = loaded.index.nearest(
            &query,
            options.k,
            options.score_threshold,
            filter.as_ref(),
        )?;

        let term = options.search_term.as_deref().map(str::to_lowercase);
        let results: Vec<QueryResult> = hits
            .into_iter()
            .filter(|hit| {
                term.as_deref().is_none_or(|t| {
                    hit.record.text.to_lowercase().contains(t)
                })
            })
            .map(|hit| QueryResult {
                id: hit.record.record_id(),
                score: hit.score,
                text: hit.record.text.clone(),
                metadata: hit.record.metadata.clone(),
            })
            .collect();

        tracing::debug!(collection, results = results.len(), "query finished");
        Ok(results)
    }

    /// Drop the loaded collection and release its model.
    pub fn release(&mut self) {
        if let Some(mut loaded) = self.loaded.take() {
            loaded.model.release();
            tracing::debug!(collection = %loaded.key.collection, "released collection");
        }
    }
}

impl Drop for QueryEngine<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for QueryEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

/// Numbered context blocks, as handed to a chat model or shown in
/// "chunks only" mode.
pub fn format_contexts(results: &[QueryResult]) -> String {
    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        out.push_str(&format!(
            "---------- Context {} | From File: {} | Score: {:.3} ----------\n\n{}\n\n",
            i + 1,
            r.metadata.file_name,
            r.score,
            r.text
        ));
    }
    out
}

/// One line per result naming its source file.
pub fn format_citations(results: &[QueryResult]) -> String {
    results
        .iter()
        .map(|r| r.metadata.file_name.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_json(query: &str, results: &[QueryResult]) -> Result<String> {
    #[derive(Serialize)]
    struct Output<'a> {
        query: &'a str,
        result_count: usize,
        results: &'a [QueryResult],
    }

    Ok(serde_json::to_string_pretty(&Output {
        query,
        result_count: results.len(),
        results,
    })?)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;

    use super::*;
    use crate::{
        hashing::FeatureHashEmbedder,
        vector_index::{METRIC, VectorRecord},
    };

    fn metadata(name: &str, document_type: &str) -> DocumentMetadata {
        DocumentMetadata {
            file_path: PathBuf::from(format!("/docs/{name}")),
            file_name: name.to_string(),
            file_type: "txt".to_string(),
            content_hash: format!("hash-{name}"),
            created_at: None,
            modified_at: Utc::now(),
            document_type: document_type.to_string(),
            chunk_index: Some(0),
        }
    }

    /// Write a collection straight through the index layer.
    fn write_collection(
        data_dir: &DataDir,
        name: &str,
        texts: &[(&str, &str)],
    ) {
        let embedder = FeatureHashEmbedder::new(1024);
        let records: Vec<VectorRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, (text, document_type))| VectorRecord {
                id: i as u64,
                embedding: embedder.embed_one(text),
                text: text.to_string(),
                metadata: metadata(&format!("doc{i}.txt"), document_type),
            })
            .collect();
        let manifest = CollectionManifest {
            name: name.to_string(),
            model_id: "hashed-bow".to_string(),
            dimension: 1024,
            metric: METRIC.to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            document_count: records.len(),
            record_count: records.len(),
            built_at: Utc::now(),
        };
        VectorIndex::write(&data_dir.index_file(name), &manifest, &records)
            .unwrap();
    }

    fn setup() -> (tempfile::TempDir, DataDir) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        write_collection(
            &data_dir,
            "recipes",
            &[
                ("apple pie recipe", "document"),
                ("banana bread recipe", "document"),
                ("car repair manual", "document"),
                ("photo of a recipe card", "image"),
            ],
        );
        (tmp, data_dir)
    }

    fn texts(results: &[QueryResult]) -> Vec<&str> {
        results.iter().map(|r| r.text.as_str()).collect()
    }

    #[test]
    fn missing_collection_fails_before_loading_a_model() {
        let (_tmp, data_dir) = setup();
        let settings = Settings::default();
        let mut engine = QueryEngine::with_model_factory(
            &data_dir,
            &settings,
            Box::new(|_: &CollectionManifest| -> Box<dyn Embedder> {
                panic!("model must not be created")
            }),
        );
        assert!(matches!(
            engine.query("nothing", "anything"),
            Err(Error::IndexNotFound { .. })
        ));
    }

    #[test]
    fn recipes_rank_above_the_manual() {
        let (_tmp, data_dir) = setup();
        let settings = Settings {
            k: 2,
            document_type_filter: Some("document".into()),
            ..Settings::default()
        };
        let mut engine = QueryEngine::new(&data_dir, &settings);

        let results = engine.query("recipes", "dessert recipe").unwrap();
        let mut found = texts(&results);
        found.sort();
        assert_eq!(found, vec!["apple pie recipe", "banana bread recipe"]);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn exact_text_comes_back_first() {
        let (_tmp, data_dir) = setup();
        let settings = Settings::default();
        let mut engine = QueryEngine::new(&data_dir, &settings);

        let results = engine.query("recipes", "car repair manual").unwrap();
        assert_eq!(results[0].text, "car repair manual");
        assert!((results[0].score - 1.0).abs() < 1e-4);
    }

    #[test]
    fn document_type_filter_and_large_k() {
        let (_tmp, data_dir) = setup();
        let settings = Settings {
            k: 100,
            score_threshold: f32::MIN,
            ..Settings::default()
        };
        let mut engine = QueryEngine::new(&data_dir, &settings);

        let all = engine.query("recipes", "recipe").unwrap();
        assert_eq!(all.len(), 4);

        let options = QueryOptions {
            document_type: Some("image".into()),
            ..QueryOptions::from_settings(&settings)
        };
        let images = engine.query_with("recipes", "recipe", &options).unwrap();
        assert_eq!(texts(&images), vec!["photo of a recipe card"]);
    }

    #[test]
    fn search_term_applies_after_top_k() {
        let (_tmp, data_dir) = setup();
        let settings = Settings {
            k: 1,
            score_threshold: f32::MIN,
            search_term_filter: Some("BANANA".into()),
            ..Settings::default()
        };
        let mut engine = QueryEngine::new(&data_dir, &settings);

        // Top-1 for this query is the apple pie, which the term removes.
        assert!(engine.query("recipes", "apple pie recipe").unwrap().is_empty());

        let options = QueryOptions {
            k: 4,
            ..QueryOptions::from_settings(&settings)
        };
        let results =
            engine.query_with("recipes", "apple pie recipe", &options).unwrap();
        assert_eq!(texts(&results), vec!["banana bread recipe"]);
    }

    #[test]
    fn switching_collections_reloads() {
        let (_tmp, data_dir) = setup();
        write_collection(&data_dir, "cars", &[("engine oil", "document")]);
        let settings = Settings::default();
        let mut engine = QueryEngine::new(&data_dir, &settings);

        engine.switch_to("recipes").unwrap();
        assert_eq!(engine.manifest().unwrap().record_count, 4);
        engine.switch_to("recipes").unwrap();
        assert_eq!(engine.key().unwrap().collection, "recipes");

        engine.switch_to("cars").unwrap();
        assert_eq!(engine.key().unwrap().collection, "cars");
        assert_eq!(engine.manifest().unwrap().record_count, 1);

        engine.release();
        assert!(engine.key().is_none());
    }

    #[test]
    fn model_with_wrong_dimension_is_rejected() {
        let (_tmp, data_dir) = setup();
        let settings = Settings::default();
        let mut engine = QueryEngine::with_model_factory(
            &data_dir,
            &settings,
            Box::new(|_: &CollectionManifest| -> Box<dyn Embedder> {
                Box::new(FeatureHashEmbedder::new(16))
            }),
        );
        assert!(matches!(
            engine.query("recipes", "pie"),
            Err(Error::DimensionMismatch {
                expected: 1024,
                actual: 16
            })
        ));
    }

    #[test]
    fn rebuilt_collection_is_picked_up() {
        let (_tmp, data_dir) = setup();
        let settings = Settings::default();
        let mut engine = QueryEngine::new(&data_dir, &settings);
        engine.switch_to("recipes").unwrap();

        std::thread::sleep(Duration::from_millis(5));
        write_collection(&data_dir, "recipes", &[("only one", "document")]);
        let results = engine.query("recipes", "only one").unwrap();
        assert_eq!(texts(&results), vec!["only one"]);
    }

    #[test]
    fn formatting_helpers() {
        let results = vec![QueryResult {
            id: RecordId::new("hash", 0),
            score: 0.5,
            text: "apple pie".into(),
            metadata: metadata("pie.txt", "document"),
        }];

        let contexts = format_contexts(&results);
        assert!(contexts.contains("Context 1 | From File: pie.txt"));
        assert!(contexts.contains("apple pie"));
        assert_eq!(format_citations(&results), "pie.txt");

        let json: serde_json::Value =
            serde_json::from_str(&format_json("pie", &results).unwrap()).unwrap();
        assert_eq!(json["result_count"], 1);
        assert_eq!(json["results"][0]["id"], results[0].id.short.as_str());
    }
}
