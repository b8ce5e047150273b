use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use fileguessr::{
    config::{
        BackendChoice,
        Config,
        DEFAULT_CLUSTER_INDEX,
        DEFAULT_CLUSTER_URL,
        DEFAULT_MODEL,
        DEFAULT_OLLAMA_URL,
        DEFAULT_WORKERS,
    },
    search::DEFAULT_LIMIT,
    walker::{DEFAULT_EXCLUDES, DEFAULT_MAX_FILE_SIZE},
};

#[derive(Debug, Parser)]
#[command(
    name = "fileguessr",
    version,
    about = "Find local files by describing them"
)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Runtime settings shared by every subcommand.
#[derive(Debug, Args)]
pub struct Settings {
    /// Override the XDG data directory
    #[arg(long, global = true, env = "FILEGUESSR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the Ollama server
    #[arg(long, global = true, env = "FILEGUESSR_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,

    /// Model used for summaries, captions and query expansion
    #[arg(long, global = true, env = "FILEGUESSR_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Index backend to use
    #[arg(long, global = true, env = "FILEGUESSR_BACKEND", value_enum, default_value_t)]
    pub backend: BackendChoice,

    /// Elasticsearch URL for the cluster backend
    #[arg(long, global = true, env = "FILEGUESSR_CLUSTER_URL", default_value = DEFAULT_CLUSTER_URL)]
    pub cluster_url: String,

    /// Elasticsearch index name
    #[arg(long, global = true, env = "FILEGUESSR_CLUSTER_INDEX", default_value = DEFAULT_CLUSTER_INDEX)]
    pub cluster_index: String,

    /// Files indexed concurrently (1-8)
    #[arg(long, global = true, env = "FILEGUESSR_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Quiet period before a burst of file changes is processed
    #[arg(long, global = true, env = "FILEGUESSR_DEBOUNCE_MS", default_value_t = 1500)]
    pub debounce_ms: u64,

    /// Timeout for a single model call while indexing
    #[arg(long, global = true, env = "FILEGUESSR_LLM_TIMEOUT_SECS", default_value_t = 120)]
    pub llm_timeout_secs: u64,

    /// Timeout for query expansion before falling back to the raw query
    #[arg(long, global = true, env = "FILEGUESSR_EXPAND_TIMEOUT_SECS", default_value_t = 20)]
    pub expand_timeout_secs: u64,

    /// Skip files larger than this many bytes
    #[arg(long, global = true, env = "FILEGUESSR_MAX_FILE_SIZE", default_value_t = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: u64,

    /// Extra glob of paths to skip (repeatable)
    #[arg(long = "exclude", global = true, value_name = "GLOB")]
    pub excludes: Vec<String>,
}

impl Settings {
    pub fn into_config(self) -> Config {
        let mut excludes: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(self.excludes);
        Config {
            data_dir: self.data_dir,
            ollama_url: self.ollama_url,
            model: self.model,
            backend: self.backend,
            cluster_url: self.cluster_url,
            cluster_index: self.cluster_index,
            workers: self.workers,
            debounce: Duration::from_millis(self.debounce_ms),
            llm_timeout: Duration::from_secs(self.llm_timeout_secs),
            expand_timeout: Duration::from_secs(self.expand_timeout_secs),
            max_file_size: self.max_file_size,
            excludes,
            ..Config::default()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP service and watch registered folders
    Serve(ServeArgs),
    /// Index a folder and register it for watching
    Index(IndexArgs),
    /// Search indexed files
    Search(SearchArgs),
    /// Manage watched folders
    Folders {
        #[command(subcommand)]
        action: FolderAction,
    },
    /// Remove every indexed record, keeping watched folders
    Clear,
    /// Show backend, model and index statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "FILEGUESSR_ADDR", default_value = "127.0.0.1:8000")]
    pub addr: SocketAddr,
}

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Folder to index
    pub folder: PathBuf,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// What the file is about
    #[arg(default_value = "")]
    pub query: String,

    /// Attach a file to search by its content
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Number of results to return
    #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum FolderAction {
    /// List watched folders
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop watching a folder and delete its records
    Remove {
        /// Folder to remove
        folder: PathBuf,
    },
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

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
            "fileguessr",
            &mut std::io::stdout(),
        );
    }
}
