use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::filters::SearchFilters;
use crate::db::graph;
use crate::db::repositories::active_snapshot_of;
use crate::db::vectors::search_vectors;
use crate::db::{EngineError, EngineResult, SqlDb};
use crate::embedder::Embedder;
use crate::fts::{FtsHit, FtsIndex};

use super::types::{RetrievalMethod, RetrievedContext};
use super::walker::GraphWalker;

/// Reciprocal Rank Fusion constant.
const RRF_K: f32 = 60.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Vector,
    Keyword,
    Hybrid,
}

impl Strategy {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "vector" => Ok(Strategy::Vector),
            "keyword" => Ok(Strategy::Keyword),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(EngineError::Usage(format!("unknown strategy {other}"))),
        }
    }

    fn method(&self) -> RetrievalMethod {
        match self {
            Strategy::Vector => RetrievalMethod::Vector,
            Strategy::Keyword => RetrievalMethod::Keyword,
            Strategy::Hybrid => RetrievalMethod::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeKey {
    Chunk(i64),
    File(i64),
}

#[derive(Debug, Clone, Copy)]
struct Fused {
    key: NodeKey,
    score: f32,
    vector_similarity: f32,
}

/// Answers queries with ranked, context-enriched chunks. The embedding
/// provider is only touched when the strategy needs a query vector.
pub struct RetrievalEngine {
    db: SqlDb,
    fts: Arc<FtsIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    walker: GraphWalker,
}

impl RetrievalEngine {
    pub fn new(db: SqlDb, fts: Arc<FtsIndex>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let walker = GraphWalker::new(db.clone());
        Self {
            db,
            fts,
            embedder,
            walker,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        repo_id: i64,
        snapshot_id: Option<i64>,
        limit: usize,
        strategy: Strategy,
        filters: &SearchFilters,
    ) -> EngineResult<Vec<RetrievedContext>> {
        let snapshot_id = match snapshot_id {
            Some(id) => id,
            None => match active_snapshot_of(&self.db, repo_id).await? {
                Some(id) => id,
                None => return Ok(Vec::new()),
            },
        };

        let candidates = limit.max(1) * 2;
        let fused = match strategy {
            Strategy::Vector => {
                let hits = self.vector_hits(query, candidates, snapshot_id, filters).await?;
                hits.into_iter()
                    .map(|(key, similarity)| Fused {
                        key,
                        score: similarity,
                        vector_similarity: similarity,
                    })
                    .collect()
            }
            Strategy::Keyword => {
                let hits = self
                    .fts
                    .search(query, candidates, snapshot_id, filters)
                    .await?;
                hits.into_iter()
                    .map(|hit| Fused {
                        key: key_of(&hit),
                        score: hit.score,
                        vector_similarity: 0.0,
                    })
                    .collect()
            }
            Strategy::Hybrid => {
                let (vector, keyword) = futures::join!(
                    self.vector_hits(query, candidates, snapshot_id, filters),
                    self.fts.search(query, candidates, snapshot_id, filters)
                );
                fuse(vector?, keyword?)
            }
        };

        let mut ranked: Vec<Fused> = fused;
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.vector_similarity
                        .partial_cmp(&a.vector_similarity)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(key_order(&a.key).cmp(&key_order(&b.key)))
        });
        ranked.truncate(limit);
        debug!(snapshot_id, results = ranked.len(), ?strategy, "retrieval ranked");

        let mut results = Vec::with_capacity(ranked.len());
        for fused in ranked {
            if let Some(context) = self.hydrate(fused, strategy.method()).await? {
                results.push(context);
            }
        }
        Ok(results)
    }

    async fn vector_hits(
        &self,
        query: &str,
        candidates: usize,
        snapshot_id: i64,
        filters: &SearchFilters,
    ) -> EngineResult<Vec<(NodeKey, f32)>> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            EngineError::Usage("vector search requires an embedding provider".into())
        })?;
        let query_vector = {
            let mut vector = embedder.embed(query).await?;
            crate::db::vectors::normalize(&mut vector);
            vector
        };
        let hits = search_vectors(
            &self.db,
            &query_vector,
            candidates,
            snapshot_id,
            embedder.model_name(),
            filters,
        )
        .await?;
        Ok(hits
            .into_iter()
            .map(|hit| (NodeKey::Chunk(hit.chunk_id), hit.similarity))
            .collect())
    }

    async fn hydrate(
        &self,
        fused: Fused,
        method: RetrievalMethod,
    ) -> EngineResult<Option<RetrievedContext>> {
        match fused.key {
            NodeKey::Chunk(chunk_id) => {
                let Some(chunk) = graph::chunk_by_id(&self.db, chunk_id).await? else {
                    return Ok(None);
                };
                let content = graph::content_text(&self.db, &chunk.content_hash)
                    .await?
                    .unwrap_or_default();
                let annotations = self.walker.annotate(chunk_id).await?;
                Ok(Some(RetrievedContext {
                    node_id: format!("chunk:{chunk_id}"),
                    file_path: chunk.rel_path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    content,
                    score: fused.score,
                    retrieval_method: method,
                    semantic_labels: chunk.tags(),
                    parent_context: annotations.parent_context,
                    outgoing_definitions: annotations.outgoing_definitions,
                    prev_chunk_id: annotations.prev_chunk_id,
                    next_chunk_id: annotations.next_chunk_id,
                    parent_chunk_id: annotations.parent_chunk_id,
                }))
            }
            NodeKey::File(file_id) => {
                let Some(file) = graph::file_by_id(&self.db, file_id).await? else {
                    return Ok(None);
                };
                let content = match &file.content_hash {
                    Some(hash) => graph::content_text(&self.db, hash)
                        .await?
                        .unwrap_or_default(),
                    None => String::new(),
                };
                let end_line = content.lines().count().max(1) as i64;
                Ok(Some(RetrievedContext {
                    node_id: format!("file:{file_id}"),
                    file_path: file.rel_path.clone(),
                    start_line: 1,
                    end_line,
                    content,
                    score: fused.score,
                    retrieval_method: method,
                    semantic_labels: vec![file.category.clone()],
                    parent_context: None,
                    outgoing_definitions: Vec::new(),
                    prev_chunk_id: None,
                    next_chunk_id: None,
                    parent_chunk_id: None,
                }))
            }
        }
    }
}

fn key_of(hit: &FtsHit) -> NodeKey {
    match hit.chunk_id {
        Some(chunk_id) => NodeKey::Chunk(chunk_id),
        None => NodeKey::File(hit.file_id),
    }
}

fn key_order(key: &NodeKey) -> i64 {
    match key {
        NodeKey::Chunk(id) => *id,
        NodeKey::File(id) => *id,
    }
}

/// Reciprocal Rank Fusion with k = 60: `score(d) = Σ 1 / (k + rank_i(d))`
/// over the vector and keyword lists, ranks 1-based.
fn fuse(vector: Vec<(NodeKey, f32)>, keyword: Vec<FtsHit>) -> Vec<Fused> {
    let mut fused: HashMap<NodeKey, Fused> = HashMap::new();

    for (rank, (key, similarity)) in vector.into_iter().enumerate() {
        let rrf = 1.0 / (RRF_K + (rank + 1) as f32);
        let entry = fused.entry(key).or_insert(Fused {
            key,
            score: 0.0,
            vector_similarity: similarity,
        });
        entry.score += rrf;
        entry.vector_similarity = entry.vector_similarity.max(similarity);
    }

    for (rank, hit) in keyword.into_iter().enumerate() {
        let key = key_of(&hit);
        let rrf = 1.0 / (RRF_K + (rank + 1) as f32);
        let entry = fused.entry(key).or_insert(Fused {
            key,
            score: 0.0,
            vector_similarity: 0.0,
        });
        entry.score += rrf;
    }

    fused.into_values().collect()
}
