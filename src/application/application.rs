use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::chunking::languages::TSLanguageParsing;
use crate::db::{sqlite, EngineResult, SqlDb};
use crate::embedder::pipeline::EmbeddingPipeline;
use crate::embedder::{Embedder, RemoteEmbedder};
use crate::fts::FtsIndex;
use crate::indexer::orchestrator::IndexerOrchestrator;
use crate::reader::SnapshotReader;
use crate::relations::RelationSource;
use crate::repo::sync::RepoManager;
use crate::retrieval::RetrievalEngine;

use super::config::configuration::Configuration;
use super::logging::tracing::tracing_subscribe;

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

const DB_MAX_CONNECTIONS: u32 = 10;

/// Owns the shared state every subsystem hangs off: configuration,
/// database pool, full-text index, language registry, repo manager, and
/// the optional embedding provider.
pub struct Application {
    pub config: Arc<Configuration>,
    pub sql: SqlDb,
    pub fts: Arc<FtsIndex>,
    pub languages: Arc<TSLanguageParsing>,
    pub repos: Arc<RepoManager>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl Application {
    pub async fn initialize(config: Configuration) -> EngineResult<Self> {
        let sql = sqlite::init_sqlite_db(&config.db_url, DB_MAX_CONNECTIONS).await?;
        let fts = Arc::new(FtsIndex::open(&config.index_path())?);
        let languages = Arc::new(TSLanguageParsing::init());
        let repos = Arc::new(RepoManager::new(config.repo_volume.clone()));

        let embedder: Option<Arc<dyn Embedder>> = match &config.embedding_api_key {
            Some(api_key) => Some(Arc::new(RemoteEmbedder::new(
                config.embedding_api_base.clone(),
                api_key.clone(),
                config.embedding_model.clone(),
                config.embedding_dimension,
            )?)),
            None => {
                info!("no embedding credential configured; vector search disabled");
                None
            }
        };

        Ok(Self {
            config: Arc::new(config),
            sql,
            fts,
            languages,
            repos,
            embedder,
        })
    }

    pub fn install_logging(config: &Configuration) {
        if let Some(true) = LOGGER_INSTALLED.get() {
            return;
        }
        if !tracing_subscribe(config) {
            warn!("failed to install tracing subscriber; one is probably installed already");
        }
        LOGGER_INSTALLED.set(true).unwrap();
    }

    pub fn indexer(&self, relation_sources: Vec<Arc<dyn RelationSource>>) -> IndexerOrchestrator {
        IndexerOrchestrator::new(
            self.config.clone(),
            self.sql.clone(),
            self.fts.clone(),
            self.languages.clone(),
            self.repos.clone(),
            relation_sources,
        )
    }

    pub fn retrieval(&self) -> RetrievalEngine {
        RetrievalEngine::new(self.sql.clone(), self.fts.clone(), self.embedder.clone())
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(self.sql.clone())
    }

    pub fn embedding_pipeline(&self, batch_size: Option<usize>) -> Option<EmbeddingPipeline> {
        let embedder = self.embedder.clone()?;
        Some(EmbeddingPipeline::new(
            self.sql.clone(),
            embedder,
            batch_size.unwrap_or(self.config.embed_batch_size),
            self.config.max_concurrency,
        ))
    }
}
