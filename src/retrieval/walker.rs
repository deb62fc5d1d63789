use crate::db::graph::{self, ChunkRow};
use crate::db::{EngineResult, SqlDb};

use super::types::{OutgoingDefinition, ParentContext};

/// Symbols surfaced per hit.
const MAX_OUTGOING: i64 = 20;

#[derive(Debug, Default)]
pub struct Annotations {
    pub parent_context: Option<ParentContext>,
    pub outgoing_definitions: Vec<OutgoingDefinition>,
    pub prev_chunk_id: Option<i64>,
    pub next_chunk_id: Option<i64>,
    pub parent_chunk_id: Option<i64>,
}

/// One-hop graph annotation for retrieval hits: the enclosing block and
/// the definitions reachable through call/reference edges.
pub struct GraphWalker {
    db: SqlDb,
}

impl GraphWalker {
    pub fn new(db: SqlDb) -> Self {
        Self { db }
    }

    pub async fn annotate(&self, chunk_id: i64) -> EngineResult<Annotations> {
        let parent = graph::parent(&self.db, chunk_id).await?;
        let parent_context = match &parent {
            Some(parent_chunk) => Some(self.parent_context(parent_chunk).await?),
            None => None,
        };

        let outgoing = graph::outgoing_definitions(&self.db, chunk_id, MAX_OUTGOING).await?;
        let outgoing_definitions = outgoing
            .into_iter()
            .map(|hit| {
                let name = hit
                    .chunk
                    .identifiers()
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| format!("chunk:{}", hit.chunk.id));
                OutgoingDefinition {
                    name,
                    relation: hit.kind.as_str().to_owned(),
                    chunk_id: hit.chunk.id,
                    file_path: hit.chunk.rel_path.clone(),
                    start_line: hit.chunk.start_line,
                }
            })
            .collect();

        let prev = graph::neighbor(&self.db, chunk_id, false).await?;
        let next = graph::neighbor(&self.db, chunk_id, true).await?;

        Ok(Annotations {
            parent_context,
            outgoing_definitions,
            prev_chunk_id: prev.map(|c| c.id),
            next_chunk_id: next.map(|c| c.id),
            parent_chunk_id: parent.map(|c| c.id),
        })
    }

    async fn parent_context(&self, parent: &ChunkRow) -> EngineResult<ParentContext> {
        let text = graph::content_text(&self.db, &parent.content_hash)
            .await?
            .unwrap_or_default();
        let heading = text.lines().next().unwrap_or_default().to_owned();
        Ok(ParentContext {
            chunk_id: parent.id,
            file_path: parent.rel_path.clone(),
            start_line: parent.start_line,
            end_line: parent.end_line,
            semantic_labels: parent.tags(),
            heading,
        })
    }
}
