//! docvault - local document collections with filtered vector search.
//!
//! docvault loads heterogeneous files (text, markdown, CSV, HTML, Evernote
//! exports, PDF, Office and OpenDocument files, EPUB books, email,
//! transcripts and images) with a two-level parallel
//! loader pool, splits them into bounded chunks, embeds the chunks and
//! stores them in a flat per-collection index that supports exact top-k
//! retrieval with metadata and text filters.
//!
//! # Quick start
//!
//! ```no_run
//! use docvault::{
//!     CancelToken, ConfigDb, DataDir, IndexBuilder, LoaderPool, ModelManager,
//!     QueryEngine, Settings,
//!     loader_pool::ThreadRunner,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config_db = ConfigDb::open(&data_dir.config_db()).unwrap();
//! let settings = Settings::load(&config_db).unwrap();
//!
//! let pool = LoaderPool::new(&settings, Box::new(ThreadRunner));
//! let mut model = ModelManager::with_model_id(
//!     &settings.embedding_model,
//!     settings.compute_device_build,
//! );
//! IndexBuilder::new(&data_dir, &config_db, &settings)
//!     .build_from_directory(
//!         "notes",
//!         "./notes".as_ref(),
//!         &pool,
//!         &mut model,
//!         &CancelToken::new(),
//!     )
//!     .unwrap();
//!
//! let mut engine = QueryEngine::new(&data_dir, &settings);
//! for r in engine.query("notes", "rust programming").unwrap() {
//!     println!("{} (score: {:.3})", r.metadata.file_name, r.score);
//! }
//! ```

pub mod bert;
pub mod builder;
pub mod cancel;
pub mod chunking;
pub mod config_db;
pub mod data_dir;
pub mod doc_id;
pub mod embedding;
pub mod error;
pub mod hashing;
pub mod loader_pool;
pub mod loaders;
pub mod lock;
pub mod markup;
pub mod metadata;
pub mod model_manager;
pub mod office;
pub mod query;
pub mod registry;
pub mod settings;
pub mod vector_index;
pub mod vision;
pub mod walker;
pub mod worker;

pub use builder::{BuildSummary, IndexBuilder};
pub use cancel::CancelToken;
pub use chunking::{Chunk, ChunkSplitter};
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use doc_id::RecordId;
pub use embedding::Embedder;
pub use error::{Error, Result};
pub use loader_pool::{LoadReport, LoaderPool};
pub use loaders::{DocumentContent, RawDocument};
pub use metadata::DocumentMetadata;
pub use model_manager::ModelManager;
pub use query::{QueryEngine, QueryResult};
pub use registry::FormatRegistry;
pub use settings::Settings;
pub use vector_index::{CollectionManifest, VectorIndex};
