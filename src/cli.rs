use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docvault",
    version,
    about = "Build local vector collections from your documents and search them"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Embedding model: HuggingFace id, local path, or hashed-bow[-DIM]
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load every supported file in a directory into a named collection,
    /// replacing its previous contents
    Build(BuildArgs),
    /// Search a collection
    Query(QueryArgs),
    /// Search a collection interactively
    Repl(ReplArgs),
    /// List built collections
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a collection and all its files
    Remove {
        /// Name of the collection to remove
        name: String,
    },
    /// Show system status and statistics
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
    /// Load one batch of files (JSON on stdin, JSON on stdout)
    #[command(name = "load-batch", hide = true)]
    LoadBatch,
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Collection name
    pub name: String,

    /// Directory to load documents from
    pub source: PathBuf,

    /// Maximum chunk length in characters
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long)]
    pub chunk_overlap: Option<usize>,

    /// Device used for embedding (cpu, gpu:N)
    #[arg(long)]
    pub device: Option<String>,

    /// Load files with threads of this process instead of worker processes
    #[arg(long)]
    pub in_process: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl BuildArgs {
    pub fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(size) = self.chunk_size {
            overrides.push(("chunk_size", size.to_string()));
        }
        if let Some(overlap) = self.chunk_overlap {
            overrides.push(("chunk_overlap", overlap.to_string()));
        }
        if let Some(device) = &self.device {
            overrides.push(("compute_device_build", device.clone()));
        }
        if self.no_progress {
            overrides.push(("show_progress", "false".to_string()));
        }
        overrides
    }
}

// -- Query --

#[derive(Debug, Args)]
pub struct SearchOptions {
    /// Number of contexts to return
    #[arg(short = 'k', long)]
    pub k: Option<usize>,

    /// Minimum relevance score
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Only return chunks of this document type (document, image, audio)
    #[arg(long)]
    pub document_type: Option<String>,

    /// Only return chunks containing this text (case-insensitive)
    #[arg(long)]
    pub search_term: Option<String>,

    /// Device used for embedding the query (cpu, gpu:N)
    #[arg(long)]
    pub device: Option<String>,
}

impl SearchOptions {
    pub fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(k) = self.k {
            overrides.push(("k", k.to_string()));
        }
        if let Some(score) = self.min_score {
            overrides.push(("score_threshold", score.to_string()));
        }
        if let Some(kind) = &self.document_type {
            overrides.push(("document_type_filter", kind.clone()));
        }
        if let Some(term) = &self.search_term {
            overrides.push(("search_term_filter", term.clone()));
        }
        if let Some(device) = &self.device {
            overrides.push(("compute_device_query", device.clone()));
        }
        overrides
    }
}

#[derive(Debug, Parser)]
pub struct QueryArgs {
    /// Collection to search
    pub name: String,

    /// The search query
    pub query: String,

    #[command(flatten)]
    pub options: SearchOptions,

    /// Output results as JSON
    #[arg(long, conflicts_with = "citations")]
    pub json: bool,

    /// Output only the source file of each result
    #[arg(long)]
    pub citations: bool,
}

#[derive(Debug, Parser)]
pub struct ReplArgs {
    /// Collection to search first (switch with `:use NAME`)
    pub name: String,

    #[command(flatten)]
    pub options: SearchOptions,
}

// -- Settings --

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Show the effective value of every setting
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in config.redb
    Set {
        /// Setting name (see `settings show`)
        key: String,
        /// New value
        value: String,
    },
    /// Remove a stored setting (all of them without a key)
    Clear {
        /// Setting name
        key: Option<String>,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docvault",
            &mut std::io::stdout(),
        );
    }
}
