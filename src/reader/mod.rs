use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::db::graph::{self, ChunkRow};
use crate::db::snapshots::snapshot_manifest;
use crate::db::{EngineError, EngineResult, SqlDb};
use crate::indexer::stats::{ManifestKind, ManifestNode};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ManifestKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborDirection {
    Prev,
    Next,
}

#[derive(Serialize, Debug, Clone)]
pub struct ChunkText {
    pub chunk_id: i64,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content: String,
    pub semantic_labels: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct GraphReference {
    pub chunk_id: i64,
    pub file_path: String,
    pub start_line: i64,
    pub relation: String,
    pub name: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct PipelineNode {
    pub chunk_id: i64,
    pub label: String,
    pub file_path: String,
    pub cycle: bool,
    pub children: Vec<PipelineNode>,
}

/// File-level reads and graph traversal primitives over one snapshot.
pub struct SnapshotReader {
    db: SqlDb,
}

impl SnapshotReader {
    pub fn new(db: SqlDb) -> Self {
        Self { db }
    }

    /// Reconstruct a file's text. Parsed files read from their stored
    /// full-text content row (falling back to chunk concatenation);
    /// skipped and failed files always have the full text stored. A file
    /// with neither reads as empty.
    pub async fn read_file(
        &self,
        snapshot_id: i64,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> EngineResult<String> {
        let file = graph::file_by_path(&self.db, snapshot_id, path)
            .await?
            .ok_or_else(|| {
                EngineError::Usage(format!("no file {path} in snapshot {snapshot_id}"))
            })?;

        let mut text = match &file.content_hash {
            Some(hash) => graph::content_text(&self.db, hash).await?.unwrap_or_default(),
            None => String::new(),
        };
        if text.is_empty() {
            let chunks = graph::chunks_of_file(&self.db, file.id).await?;
            let mut pieces = Vec::new();
            for chunk in top_level(&chunks) {
                if let Some(piece) = graph::content_text(&self.db, &chunk.content_hash).await? {
                    pieces.push(piece);
                }
            }
            text = pieces.join("\n");
        }

        if start_line.is_some() || end_line.is_some() {
            let lines: Vec<&str> = text.lines().collect();
            let start = start_line.unwrap_or(1).max(1) - 1;
            let end = end_line.unwrap_or(lines.len()).min(lines.len());
            if start >= end {
                return Ok(String::new());
            }
            let mut sliced = lines[start..end].join("\n");
            sliced.push('\n');
            return Ok(sliced);
        }
        Ok(text)
    }

    /// List a directory from the snapshot manifest: O(1) against the file
    /// table, directories first, alphabetical within each group.
    pub async fn list_directory(
        &self,
        snapshot_id: i64,
        path: &str,
    ) -> EngineResult<Vec<DirEntry>> {
        let root = self.manifest(snapshot_id).await?;
        let node = descend(&root, path).ok_or_else(|| {
            EngineError::Usage(format!("no directory {path} in snapshot {snapshot_id}"))
        })?;

        let prefix = if path.is_empty() || path == "/" {
            String::new()
        } else {
            format!("{}/", path.trim_matches('/'))
        };
        Ok(node
            .children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|child| DirEntry {
                name: child.name.clone(),
                kind: child.kind,
                path: format!("{prefix}{}", child.name),
            })
            .collect())
    }

    /// Walk the manifest in memory for directories whose name contains
    /// `pattern` (case-insensitive).
    pub async fn find_directories(
        &self,
        snapshot_id: i64,
        pattern: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let root = self.manifest(snapshot_id).await?;
        let needle = pattern.to_lowercase();
        let mut found = Vec::new();
        collect_dirs(&root, "", &needle, limit, &mut found);
        Ok(found)
    }

    pub async fn read_neighbor_chunk(
        &self,
        chunk_id: i64,
        direction: NeighborDirection,
    ) -> EngineResult<Option<ChunkText>> {
        let neighbor = graph::neighbor(
            &self.db,
            chunk_id,
            matches!(direction, NeighborDirection::Next),
        )
        .await?;
        match neighbor {
            Some(chunk) => Ok(Some(self.chunk_text(chunk).await?)),
            None => Ok(None),
        }
    }

    pub async fn read_parent_chunk(&self, chunk_id: i64) -> EngineResult<Option<ChunkText>> {
        match graph::parent(&self.db, chunk_id).await? {
            Some(chunk) => Ok(Some(self.chunk_text(chunk).await?)),
            None => Ok(None),
        }
    }

    /// What would break if this chunk changed: incoming call/reference
    /// edges, nearest first.
    pub async fn analyze_impact(
        &self,
        chunk_id: i64,
        limit: usize,
    ) -> EngineResult<Vec<GraphReference>> {
        let hits = graph::incoming_refs(&self.db, chunk_id, limit as i64).await?;
        Ok(hits.into_iter().map(reference_of).collect())
    }

    /// What this chunk depends on: outgoing edges to definitions.
    pub async fn analyze_dependencies(&self, chunk_id: i64) -> EngineResult<Vec<GraphReference>> {
        let hits = graph::outgoing_calls(&self.db, chunk_id, 50).await?;
        Ok(hits.into_iter().map(reference_of).collect())
    }

    /// Call tree rooted at a chunk, cycle-cut with a visited set and a
    /// hard depth cap.
    pub async fn visualize_pipeline(
        &self,
        chunk_id: i64,
        max_depth: usize,
    ) -> EngineResult<Option<PipelineNode>> {
        let Some(root) = graph::chunk_by_id(&self.db, chunk_id).await? else {
            return Ok(None);
        };
        let mut visited = HashSet::new();
        Ok(Some(self.walk_pipeline(root, max_depth, &mut visited).await?))
    }

    fn walk_pipeline<'a>(
        &'a self,
        chunk: ChunkRow,
        depth_left: usize,
        visited: &'a mut HashSet<i64>,
    ) -> futures::future::BoxFuture<'a, EngineResult<PipelineNode>> {
        Box::pin(async move {
            let cycle = !visited.insert(chunk.id);
            let mut node = PipelineNode {
                chunk_id: chunk.id,
                label: label_of(&chunk),
                file_path: chunk.rel_path.clone(),
                cycle,
                children: Vec::new(),
            };
            if cycle || depth_left == 0 {
                return Ok(node);
            }

            for hit in graph::outgoing_calls(&self.db, chunk.id, 20).await? {
                let child = self
                    .walk_pipeline(hit.chunk, depth_left - 1, visited)
                    .await?;
                node.children.push(child);
            }
            Ok(node)
        })
    }

    async fn chunk_text(&self, chunk: ChunkRow) -> EngineResult<ChunkText> {
        let content = graph::content_text(&self.db, &chunk.content_hash)
            .await?
            .unwrap_or_default();
        Ok(ChunkText {
            chunk_id: chunk.id,
            file_path: chunk.rel_path,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            content,
            semantic_labels: chunk.tags(),
        })
    }

    async fn manifest(&self, snapshot_id: i64) -> EngineResult<ManifestNode> {
        let value = snapshot_manifest(&self.db, snapshot_id).await?;
        if value.is_null() {
            return Ok(ManifestNode {
                name: String::new(),
                kind: ManifestKind::Dir,
                children: Some(Vec::new()),
            });
        }
        serde_json::from_value(value)
            .map_err(|err| EngineError::State(format!("malformed manifest: {err}")))
    }
}

fn reference_of(hit: graph::EdgeHit) -> GraphReference {
    let name = hit
        .chunk
        .identifiers()
        .into_iter()
        .next()
        .unwrap_or_else(|| format!("chunk:{}", hit.chunk.id));
    GraphReference {
        chunk_id: hit.chunk.id,
        file_path: hit.chunk.rel_path,
        start_line: hit.chunk.start_line,
        relation: hit.kind.as_str().to_owned(),
        name,
    }
}

fn label_of(chunk: &ChunkRow) -> String {
    chunk
        .identifiers()
        .into_iter()
        .next()
        .unwrap_or_else(|| format!("{}:{}", chunk.rel_path, chunk.start_line))
}

/// Chunks with no parent edge recorded, i.e. the roots of the per-file
/// containment forest, in byte order.
fn top_level<'a>(chunks: &'a [ChunkRow]) -> Vec<&'a ChunkRow> {
    let contained: Vec<(i64, i64, i64)> = chunks
        .iter()
        .map(|c| (c.id, c.start_byte, c.end_byte))
        .collect();
    chunks
        .iter()
        .filter(|c| {
            !contained.iter().any(|(other_id, start, end)| {
                *other_id != c.id && *start <= c.start_byte && c.end_byte <= *end
            })
        })
        .collect()
}

fn descend<'a>(root: &'a ManifestNode, path: &str) -> Option<&'a ManifestNode> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for component in trimmed.split('/') {
        node = node
            .children
            .as_deref()?
            .iter()
            .find(|child| child.name == component && child.kind == ManifestKind::Dir)?;
    }
    Some(node)
}

fn collect_dirs(
    node: &ManifestNode,
    prefix: &str,
    needle: &str,
    limit: usize,
    found: &mut Vec<String>,
) {
    if found.len() >= limit {
        return;
    }
    for child in node.children.as_deref().unwrap_or_default() {
        if child.kind != ManifestKind::Dir {
            continue;
        }
        let path = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{prefix}/{}", child.name)
        };
        if child.name.to_lowercase().contains(needle) {
            found.push(path.clone());
            if found.len() >= limit {
                return;
            }
        }
        collect_dirs(child, &path, needle, limit, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::stats::build_manifest;

    #[test]
    fn descend_walks_nested_directories() {
        let root = build_manifest(&[
            "src/util/text.py".to_owned(),
            "src/app.py".to_owned(),
        ]);
        let util = descend(&root, "src/util").unwrap();
        assert_eq!(util.name, "util");
        assert!(descend(&root, "src/missing").is_none());
        assert!(descend(&root, "").is_some());
    }

    #[test]
    fn collect_dirs_matches_case_insensitively() {
        let root = build_manifest(&[
            "src/Utils/text.py".to_owned(),
            "lib/util_extra/mod.rs".to_owned(),
        ]);
        let mut found = Vec::new();
        collect_dirs(&root, "", "util", 10, &mut found);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&"src/Utils".to_owned()));
        assert!(found.contains(&"lib/util_extra".to_owned()));
    }
}
