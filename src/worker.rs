//! One loader batch: a bounded thread pool loading a list of files.
//!
//! [`run_batch`] does the work in-process. [`serve_stdio`] is the entry
//! point of the hidden `load-batch` subcommand: it reads a JSON
//! [`BatchRequest`] from stdin and writes a JSON [`BatchResponse`] to
//! stdout, which is how the loader pool isolates batches in separate
//! processes.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    loaders::{self, RawDocument},
    registry::{FormatRegistry, LoaderKind},
    vision::{self, ImageDescriber},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_index: usize,
    pub files: Vec<PathBuf>,
    pub vision_model: String,
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub batch_index: usize,
    pub documents: Vec<RawDocument>,
    pub failures: Vec<FileFailure>,
    /// Files not started because the batch was cancelled.
    pub skipped: usize,
}

enum Outcome {
    Loaded(RawDocument),
    Failed(FileFailure),
    Skipped,
}

fn load_one(
    path: &Path,
    registry: &FormatRegistry,
    describer: Option<&dyn ImageDescriber>,
    cancel: &CancelToken,
) -> Outcome {
    if cancel.is_cancelled() {
        return Outcome::Skipped;
    }

    let loaded = registry
        .lookup_path(path)
        .and_then(|spec| loaders::load_document(path, spec, describer));

    match loaded {
        Ok(document) => Outcome::Loaded(document),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping file");
            Outcome::Failed(FileFailure {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    }
}

/// Set up the image describer when the batch contains images.
fn prepare_describer(
    request: &BatchRequest,
    registry: &FormatRegistry,
) -> Result<Option<Box<dyn ImageDescriber>>> {
    let has_images = request.files.iter().any(|path| {
        registry
            .lookup_path(path)
            .is_ok_and(|spec| spec.kind == LoaderKind::Image)
    });
    if !has_images {
        return Ok(None);
    }

    let Some(mut describer) = vision::describer_for(&request.vision_model)?
    else {
        return Ok(None);
    };
    describer.initialize()?;
    tracing::debug!(describer = describer.name(), "image describer ready");
    Ok(Some(describer))
}

pub fn run_batch(
    request: &BatchRequest,
    cancel: &CancelToken,
) -> Result<BatchResponse> {
    let registry = FormatRegistry::for_vision_model(&request.vision_model);
    let mut describer = prepare_describer(request, &registry)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(request.threads.max(1))
        .thread_name(move |i| format!("loader-{i}"))
        .build()
        .map_err(|e| Error::Worker(format!("failed to start threads: {e}")))?;

    let outcomes: Vec<Outcome> = {
        let describer = describer.as_deref();
        pool.install(|| {
            request
                .files
                .par_iter()
                .map(|path| load_one(path, &registry, describer, cancel))
                .collect()
        })
    };

    if let Some(describer) = describer.as_mut() {
        describer.release();
    }

    let mut response = BatchResponse {
        batch_index: request.batch_index,
        documents: Vec::new(),
        failures: Vec::new(),
        skipped: 0,
    };
    for outcome in outcomes {
        match outcome {
            Outcome::Loaded(document) => response.documents.push(document),
            Outcome::Failed(failure) => response.failures.push(failure),
            Outcome::Skipped => response.skipped += 1,
        }
    }

    tracing::debug!(
        batch = request.batch_index,
        loaded = response.documents.len(),
        failed = response.failures.len(),
        "batch finished"
    );
    Ok(response)
}

/// Run a batch received as JSON on `input`, answering as JSON on `output`.
pub fn serve(input: impl Read, mut output: impl Write) -> Result<()> {
    let request: BatchRequest = serde_json::from_reader(input)?;
    let response = run_batch(&request, &CancelToken::new())?;
    serde_json::to_writer(&mut output, &response)?;
    output.flush()?;
    Ok(())
}

pub fn serve_stdio() -> Result<()> {
    serve(std::io::stdin().lock(), std::io::stdout().lock())
}
