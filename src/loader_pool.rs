//! Two-level parallel document loading.
//!
//! Files are split into `P` near-equal batches. Each batch goes to its own
//! worker (a child process by default, see [`ProcessRunner`]) that loads
//! the batch with a bounded thread pool. Batch results are merged in
//! completion order, then deduplicated by content hash.

use std::{
    collections::HashSet,
    io::Write,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    loaders::RawDocument,
    registry::FormatRegistry,
    settings::Settings,
    walker,
    worker::{self, BatchRequest, BatchResponse, FileFailure},
};

/// Name of the hidden subcommand that runs one batch.
pub const WORKER_SUBCOMMAND: &str = "load-batch";

const MAX_INNER_THREADS: usize = 8;

/// Runs one loader batch somewhere and hands back its result.
pub trait BatchRunner: Send + Sync {
    fn run(
        &self,
        request: BatchRequest,
        cancel: &CancelToken,
    ) -> Result<BatchResponse>;
}

/// Runs each batch in a child process of `executable`, which must accept
/// the `load-batch` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    executable: PathBuf,
}

impl ProcessRunner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Re-run the executable of the current process.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl BatchRunner for ProcessRunner {
    fn run(
        &self,
        request: BatchRequest,
        _cancel: &CancelToken,
    ) -> Result<BatchResponse> {
        let batch = request.batch_index;
        let mut child = Command::new(&self.executable)
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Worker(format!("batch {batch}: failed to spawn: {e}"))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            serde_json::to_writer(&mut stdin, &request)?;
            stdin.flush()?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Worker(format!(
                "batch {batch}: worker exited with {}",
                output.status
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::Worker(format!("batch {batch}: unreadable worker output: {e}"))
        })
    }
}

/// Runs batches inside the current process, each on the pool's dispatch
/// thread for that batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRunner;

impl BatchRunner for ThreadRunner {
    fn run(
        &self,
        request: BatchRequest,
        cancel: &CancelToken,
    ) -> Result<BatchResponse> {
        worker::run_batch(&request, cancel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub files: Vec<PathBuf>,
    pub reason: String,
}

/// Everything a load produced, including what went wrong.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Unique by content hash, sorted by file path.
    pub documents: Vec<RawDocument>,
    pub failures: Vec<FileFailure>,
    pub failed_batches: Vec<BatchFailure>,
    /// Documents dropped because an earlier path had the same content.
    pub duplicates: Vec<PathBuf>,
    /// Files never attempted because loading was cancelled.
    pub skipped: usize,
    pub batches: usize,
}

impl LoadReport {
    pub fn failed_files(&self) -> usize {
        self.failures.len()
            + self
                .failed_batches
                .iter()
                .map(|b| b.files.len())
                .sum::<usize>()
    }
}

/// `max(4, cpus - 4)` unless configured.
pub fn outer_worker_cap(settings: &Settings) -> usize {
    settings
        .outer_worker_cap
        .unwrap_or_else(|| 4.max(available_cpus().saturating_sub(4)))
}

/// Number of batches for `file_count` files.
pub fn worker_count(file_count: usize, cap: usize) -> usize {
    cap.max(1).min(file_count.max(1))
}

/// Threads per worker: the cores divided between the workers, 1 to 8.
pub fn inner_threads(settings: &Settings, workers: usize) -> usize {
    settings.inner_threads.unwrap_or_else(|| {
        (available_cpus() / workers.max(1)).clamp(1, MAX_INNER_THREADS)
    })
}

fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Split `items` into `parts` contiguous batches whose sizes differ by at
/// most one. Never returns empty batches.
pub fn partition<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let parts = parts.max(1).min(items.len());
    if parts == 0 {
        return Vec::new();
    }

    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut batches = Vec::with_capacity(parts);
    let mut iter = items.into_iter();
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Keep the first document per content hash, in file path order.
fn deduplicate(
    mut documents: Vec<RawDocument>,
) -> (Vec<RawDocument>, Vec<PathBuf>) {
    documents.sort_by(|a, b| a.metadata.file_path.cmp(&b.metadata.file_path));

    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    documents.retain(|doc| {
        if seen.insert(doc.metadata.content_hash.clone()) {
            true
        } else {
            tracing::info!(
                path = %doc.metadata.file_path.display(),
                "skipping duplicate content"
            );
            duplicates.push(doc.metadata.file_path.clone());
            false
        }
    });
    (documents, duplicates)
}

pub struct LoaderPool<'a> {
    settings: &'a Settings,
    registry: FormatRegistry,
    runner: Box<dyn BatchRunner + 'a>,
}

impl<'a> LoaderPool<'a> {
    pub fn new(settings: &'a Settings, runner: Box<dyn BatchRunner + 'a>) -> Self {
        Self {
            settings,
            registry: FormatRegistry::for_vision_model(&settings.vision_model),
            runner,
        }
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// Discover every loadable file under `dir` and load them all.
    pub fn load_directory(
        &self,
        dir: &Path,
        cancel: &CancelToken,
    ) -> Result<LoadReport> {
        let files: Vec<PathBuf> = walker::discover_files(dir, &self.registry)?
            .into_iter()
            .map(|f| f.absolute_path)
            .collect();
        tracing::info!(files = files.len(), dir = %dir.display(), "discovered files");
        Ok(self.load_files(files, cancel))
    }

    pub fn load_files(&self, files: Vec<PathBuf>, cancel: &CancelToken) -> LoadReport {
        let mut report = LoadReport::default();
        if files.is_empty() {
            return report;
        }

        let workers =
            worker_count(files.len(), outer_worker_cap(self.settings));
        let threads = inner_threads(self.settings, workers);
        let batches = partition(files, workers);
        report.batches = batches.len();
        tracing::debug!(workers, threads, "dispatching loader batches");

        let (tx, rx) = mpsc::channel();
        let runner = self.runner.as_ref();
        let mut documents = Vec::new();

        std::thread::scope(|scope| {
            for (batch_index, files) in batches.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    report.skipped += files.len();
                    continue;
                }

                let request = BatchRequest {
                    batch_index,
                    files,
                    vision_model: self.settings.vision_model.clone(),
                    threads,
                };
                let tx = tx.clone();
                scope.spawn(move || {
                    let files = request.files.clone();
                    // A panicking runner fails its own batch only.
                    let result = std::panic::catch_unwind(AssertUnwindSafe(
                        || runner.run(request, cancel),
                    ))
                    .unwrap_or_else(|_| {
                        Err(Error::Worker(format!(
                            "batch {batch_index}: worker panicked"
                        )))
                    });
                    // The receiver outlives every sender in this scope.
                    let _ = tx.send((batch_index, files, result));
                });
            }
            drop(tx);

            for (batch_index, files, result) in rx {
                match result {
                    Ok(response) => {
                        tracing::debug!(
                            batch = batch_index,
                            documents = response.documents.len(),
                            "batch merged"
                        );
                        documents.extend(response.documents);
                        report.failures.extend(response.failures);
                        report.skipped += response.skipped;
                    }
                    Err(e) => {
                        tracing::warn!(batch = batch_index, error = %e, "batch failed");
                        report.failed_batches.push(BatchFailure {
                            batch_index,
                            files,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        });

        let (documents, duplicates) = deduplicate(documents);
        report.documents = documents;
        report.duplicates = duplicates;
        report
            .failed_batches
            .sort_by_key(|failure| failure.batch_index);
        report
    }
}

impl std::fmt::Debug for LoaderPool<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderPool")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
