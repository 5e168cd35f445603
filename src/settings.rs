//! Runtime settings shared by every pipeline stage.
//!
//! A [`Settings`] value is assembled once per invocation (defaults, then the
//! `settings` table of the config database, then command-line overrides),
//! validated, and then passed by reference into the loader pool, the index
//! builder and the query engine. Nothing mutates it afterwards.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_K: usize = 6;
pub const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-small-en-v1.5";
pub const DEFAULT_VISION_MODEL: &str = "image-metadata";
pub const DEFAULT_LOCK_WAIT_MS: u64 = 30_000;

/// Every key accepted by `settings set`, with a short description.
pub const KEYS: &[(&str, &str)] = &[
    ("chunk_size", "maximum chunk length in characters"),
    ("chunk_overlap", "characters shared by consecutive chunks"),
    ("compute_device_build", "device used while building (cpu, gpu:N)"),
    ("compute_device_query", "device used while querying (cpu, gpu:N)"),
    ("k", "number of contexts returned per query"),
    ("score_threshold", "minimum relevance score of a returned context"),
    ("document_type_filter", "only return chunks of this document type"),
    ("search_term_filter", "only return chunks containing this text"),
    ("embedding_model", "embedding model id, local path or hashed-bow"),
    ("vision_model", "image describer (image-metadata, none)"),
    ("outer_worker_cap", "maximum loader worker processes (auto)"),
    ("inner_threads", "loader threads per worker process (auto)"),
    ("lock_wait_ms", "how long queries wait for a running build"),
    ("show_progress", "draw a progress bar while embedding"),
];

/// Where embedding inference runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Gpu(u32),
}

impl ComputeDevice {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for ComputeDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (lower.as_str(), None),
        };

        match (kind, ordinal) {
            ("cpu", None) => Ok(Self::Cpu),
            ("gpu" | "cuda" | "mps" | "metal", None) => Ok(Self::Gpu(0)),
            ("gpu" | "cuda" | "mps" | "metal", Some(n)) => {
                n.parse().map(Self::Gpu).map_err(|_| {
                    Error::Config(format!("invalid device ordinal in '{s}'"))
                })
            }
            _ => Err(Error::Config(format!(
                "unknown compute device '{s}' (expected cpu or gpu:N)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub compute_device_build: ComputeDevice,
    pub compute_device_query: ComputeDevice,
    pub k: usize,
    pub score_threshold: f32,
    pub document_type_filter: Option<String>,
    pub search_term_filter: Option<String>,
    pub embedding_model: String,
    pub vision_model: String,
    /// `None` means `max(4, cpus - 4)`.
    pub outer_worker_cap: Option<usize>,
    /// `None` divides the available cores between the workers.
    pub inner_threads: Option<usize>,
    pub lock_wait_ms: u64,
    pub show_progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            compute_device_build: ComputeDevice::Cpu,
            compute_device_query: ComputeDevice::Cpu,
            k: DEFAULT_K,
            score_threshold: 0.0,
            document_type_filter: None,
            search_term_filter: None,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            outer_worker_cap: None,
            inner_threads: None,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            show_progress: true,
        }
    }
}

impl Settings {
    /// Defaults overlaid with everything stored in the config database.
    pub fn load(config_db: &ConfigDb) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in config_db.list_settings()? {
            settings.apply(&key, &value)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Parse `value` and assign it to the field named `key`.
    ///
    /// Optional fields are cleared by `none`, `auto` or an empty string.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "chunk_size" => self.chunk_size = parse(key, value)?,
            "chunk_overlap" => self.chunk_overlap = parse(key, value)?,
            "compute_device_build" => {
                self.compute_device_build = value.parse()?
            }
            "compute_device_query" => {
                self.compute_device_query = value.parse()?
            }
            "k" => self.k = parse(key, value)?,
            "score_threshold" => self.score_threshold = parse(key, value)?,
            "document_type_filter" => {
                self.document_type_filter = optional_text(value)
            }
            "search_term_filter" => {
                self.search_term_filter = optional_text(value)
            }
            "embedding_model" => self.embedding_model = required(key, value)?,
            "vision_model" => self.vision_model = required(key, value)?,
            "outer_worker_cap" => {
                self.outer_worker_cap = optional_number(key, value)?
            }
            "inner_threads" => {
                self.inner_threads = optional_number(key, value)?
            }
            "lock_wait_ms" => self.lock_wait_ms = parse(key, value)?,
            "show_progress" => self.show_progress = parse(key, value)?,
            _ => {
                return Err(Error::Config(format!(
                    "unknown setting '{key}'"
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.k == 0 {
            return Err(Error::Config("k must be positive".into()));
        }
        if !self.score_threshold.is_finite() {
            return Err(Error::Config("score_threshold must be finite".into()));
        }
        if self.outer_worker_cap == Some(0) || self.inner_threads == Some(0) {
            return Err(Error::Config(
                "worker and thread counts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Current value of every key, formatted the way `apply` accepts it.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        fn or_auto(value: Option<usize>) -> String {
            value.map_or_else(|| "auto".to_string(), |v| v.to_string())
        }
        fn or_none(value: &Option<String>) -> String {
            value.clone().unwrap_or_else(|| "none".to_string())
        }

        vec![
            ("chunk_size", self.chunk_size.to_string()),
            ("chunk_overlap", self.chunk_overlap.to_string()),
            ("compute_device_build", self.compute_device_build.to_string()),
            ("compute_device_query", self.compute_device_query.to_string()),
            ("k", self.k.to_string()),
            ("score_threshold", self.score_threshold.to_string()),
            ("document_type_filter", or_none(&self.document_type_filter)),
            ("search_term_filter", or_none(&self.search_term_filter)),
            ("embedding_model", self.embedding_model.clone()),
            ("vision_model", self.vision_model.clone()),
            ("outer_worker_cap", or_auto(self.outer_worker_cap)),
            ("inner_threads", or_auto(self.inner_threads)),
            ("lock_wait_ms", self.lock_wait_ms.to_string()),
            ("show_progress", self.show_progress.to_string()),
        ]
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: '{value}'")))
}

fn required(key: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        Err(Error::Config(format!("{key} cannot be empty")))
    } else {
        Ok(value.to_string())
    }
}

fn is_unset(value: &str) -> bool {
    value.is_empty()
        || value.eq_ignore_ascii_case("none")
        || value.eq_ignore_ascii_case("auto")
}

fn optional_text(value: &str) -> Option<String> {
    (!is_unset(value)).then(|| value.to_string())
}

fn optional_number(key: &str, value: &str) -> Result<Option<usize>> {
    if is_unset(value) {
        Ok(None)
    } else {
        parse(key, value).map(Some)
    }
}
