use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Parser, Debug, Clone)]
pub struct Configuration {
    #[clap(long, env = "DB_URL")]
    /// Database connection string
    pub db_url: String,

    #[clap(long, env = "REPO_VOLUME", default_value_os_t = default_repo_volume())]
    #[serde(default = "default_repo_volume")]
    /// Root directory for bare mirrors and per-snapshot worktrees
    pub repo_volume: PathBuf,

    #[clap(long)]
    /// Root directory for the full-text index; defaults to `<repo_volume>/fts`
    pub index_dir: Option<PathBuf>,

    #[clap(long, env = "EMBEDDING_API_KEY")]
    /// Credential for the embedding provider
    pub embedding_api_key: Option<String>,

    #[clap(long, default_value_t = default_embedding_api_base())]
    #[serde(default = "default_embedding_api_base")]
    /// Base URL of the OpenAI-compatible embeddings endpoint
    pub embedding_api_base: String,

    #[clap(long, default_value_t = default_embedding_model())]
    #[serde(default = "default_embedding_model")]
    /// Embedding model identifier
    pub embedding_model: String,

    #[clap(long, default_value_t = default_embedding_dimension())]
    #[serde(default = "default_embedding_dimension")]
    /// Dimension of the vectors produced by the embedding model
    pub embedding_dimension: usize,

    #[clap(long, default_value_t = default_max_workers())]
    #[serde(default = "default_max_workers")]
    /// Number of parse workers
    pub max_workers: usize,

    #[clap(long, default_value_t = default_files_per_task())]
    #[serde(default = "default_files_per_task")]
    /// Files handed to one parse task
    pub files_per_task: usize,

    #[clap(long, default_value_t = default_max_concurrency())]
    #[serde(default = "default_max_concurrency")]
    /// Maximum outstanding embedding provider calls
    pub max_concurrency: usize,

    #[clap(long, default_value_t = default_embed_batch_size())]
    #[serde(default = "default_embed_batch_size")]
    /// Chunks per embedding provider call
    pub embed_batch_size: usize,

    #[clap(long, default_value_t = default_max_file_size())]
    #[serde(default = "default_max_file_size")]
    /// Per-file size cap in bytes; larger files are skipped by the collector
    pub max_file_size: u64,
}

impl Configuration {
    pub fn index_path(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| self.repo_volume.join("fts"))
    }

    /// Directory where logs are written to
    pub fn log_dir(&self) -> PathBuf {
        self.repo_volume.join("logs")
    }
}

fn default_repo_volume() -> PathBuf {
    "./data/repositories".into()
}

fn default_embedding_api_base() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_owned()
}

fn default_embedding_dimension() -> usize {
    1536
}

fn default_max_workers() -> usize {
    5
}

fn default_files_per_task() -> usize {
    50
}

fn default_max_concurrency() -> usize {
    8
}

fn default_embed_batch_size() -> usize {
    64
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}
