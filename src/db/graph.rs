use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, warn};

use super::{EngineError, EngineResult, SqlDb};

/// The relation kinds an edge can carry. `ChildOf` forms a forest per file;
/// everything else comes from call/reference analysis.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ChildOf,
    Calls,
    References,
    Imports,
    Inherits,
    Defines,
    ReadsFrom,
    Instantiates,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::ChildOf => "child_of",
            RelationKind::Calls => "calls",
            RelationKind::References => "references",
            RelationKind::Imports => "imports",
            RelationKind::Inherits => "inherits",
            RelationKind::Defines => "defines",
            RelationKind::ReadsFrom => "reads_from",
            RelationKind::Instantiates => "instantiates",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        Ok(match s {
            "child_of" => RelationKind::ChildOf,
            "calls" => RelationKind::Calls,
            "references" => RelationKind::References,
            "imports" => RelationKind::Imports,
            "inherits" => RelationKind::Inherits,
            "defines" => RelationKind::Defines,
            "reads_from" => RelationKind::ReadsFrom,
            "instantiates" => RelationKind::Instantiates,
            other => return Err(EngineError::Data(format!("unknown relation kind {other}"))),
        })
    }
}

/// A graph endpoint: a chunk, or the file-level pseudo-node for ranges that
/// resolve to no chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Chunk(i64),
    File(i64),
}

impl NodeRef {
    pub(crate) fn columns(&self) -> (Option<i64>, Option<i64>) {
        match self {
            NodeRef::Chunk(id) => (Some(*id), None),
            NodeRef::File(id) => (None, Some(*id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub file_id: i64,
    pub snapshot_id: i64,
    pub rel_path: String,
    pub language: Option<String>,
    pub category: String,
    pub content_hash: String,
    pub start_byte: i64,
    pub end_byte: i64,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: serde_json::Value,
}

impl ChunkRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        let metadata: String = row.get("metadata");
        Self {
            id: row.get("id"),
            file_id: row.get("file_id"),
            snapshot_id: row.get("snapshot_id"),
            rel_path: row.get("rel_path"),
            language: row.get("language"),
            category: row.get("category"),
            content_hash: row.get("content_hash"),
            start_byte: row.get("start_byte"),
            end_byte: row.get("end_byte"),
            start_line: row.get("start_line"),
            end_line: row.get("end_line"),
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        }
    }

    /// Semantic tags recorded at parse time.
    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get("tags")
            .and_then(|t| t.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.metadata
            .get("identifiers")
            .and_then(|t| t.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub snapshot_id: i64,
    pub rel_path: String,
    pub language: Option<String>,
    pub size: i64,
    pub category: String,
    pub git_hash: Option<String>,
    pub parsing_status: String,
    pub content_hash: Option<String>,
}

impl FileRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            snapshot_id: row.get("snapshot_id"),
            rel_path: row.get("rel_path"),
            language: row.get("language"),
            size: row.get("size"),
            category: row.get("category"),
            git_hash: row.get("git_hash"),
            parsing_status: row.get("parsing_status"),
            content_hash: row.get("content_hash"),
        }
    }
}

const CHUNK_SELECT: &str = "SELECT c.id, c.file_id, f.snapshot_id, f.rel_path, f.language, \
     f.category, c.content_hash, c.start_byte, c.end_byte, c.start_line, c.end_line, c.metadata \
     FROM chunks c JOIN files f ON f.id = c.file_id";

pub async fn chunk_by_id(db: &SqlDb, chunk_id: i64) -> EngineResult<Option<ChunkRow>> {
    let row = sqlx::query(&format!("{CHUNK_SELECT} WHERE c.id = ?"))
        .bind(chunk_id)
        .fetch_optional(db.as_ref())
        .await?;
    Ok(row.as_ref().map(ChunkRow::from_row))
}

pub async fn chunks_of_file(db: &SqlDb, file_id: i64) -> EngineResult<Vec<ChunkRow>> {
    let rows = sqlx::query(&format!(
        "{CHUNK_SELECT} WHERE c.file_id = ? ORDER BY c.start_byte, c.end_byte DESC"
    ))
    .bind(file_id)
    .fetch_all(db.as_ref())
    .await?;
    Ok(rows.iter().map(ChunkRow::from_row).collect())
}

pub async fn file_by_id(db: &SqlDb, file_id: i64) -> EngineResult<Option<FileRow>> {
    let row = sqlx::query("SELECT * FROM files WHERE id = ?")
        .bind(file_id)
        .fetch_optional(db.as_ref())
        .await?;
    Ok(row.as_ref().map(FileRow::from_row))
}

pub async fn file_by_path(
    db: &SqlDb,
    snapshot_id: i64,
    rel_path: &str,
) -> EngineResult<Option<FileRow>> {
    let row = sqlx::query("SELECT * FROM files WHERE snapshot_id = ? AND rel_path = ?")
        .bind(snapshot_id)
        .bind(rel_path)
        .fetch_optional(db.as_ref())
        .await?;
    Ok(row.as_ref().map(FileRow::from_row))
}

pub async fn content_text(db: &SqlDb, hash: &str) -> EngineResult<Option<String>> {
    let row = sqlx::query("SELECT text FROM contents WHERE hash = ?")
        .bind(hash)
        .fetch_optional(db.as_ref())
        .await?;
    Ok(row.map(|r| r.get("text")))
}

/// The enclosing chunk, through the `child_of` edge the parser recorded.
pub async fn parent(db: &SqlDb, chunk_id: i64) -> EngineResult<Option<ChunkRow>> {
    let row = sqlx::query(&format!(
        "{CHUNK_SELECT} WHERE c.id = (SELECT target_chunk_id FROM edges \
         WHERE source_chunk_id = ? AND kind = 'child_of')"
    ))
    .bind(chunk_id)
    .fetch_optional(db.as_ref())
    .await?;
    Ok(row.as_ref().map(ChunkRow::from_row))
}

pub async fn children(db: &SqlDb, chunk_id: i64) -> EngineResult<Vec<ChunkRow>> {
    let rows = sqlx::query(&format!(
        "{CHUNK_SELECT} WHERE c.id IN (SELECT source_chunk_id FROM edges \
         WHERE target_chunk_id = ? AND kind = 'child_of') ORDER BY c.start_byte"
    ))
    .bind(chunk_id)
    .fetch_all(db.as_ref())
    .await?;
    Ok(rows.iter().map(ChunkRow::from_row).collect())
}

#[derive(Debug, Clone)]
pub struct EdgeHit {
    pub kind: RelationKind,
    pub chunk: ChunkRow,
}

const GRAPH_KINDS: &str = "('calls', 'references', 'imports', 'inherits', 'defines', 'reads_from', 'instantiates')";

/// Chunks pointing at this one through non-structural edges.
pub async fn incoming_refs(db: &SqlDb, chunk_id: i64, limit: i64) -> EngineResult<Vec<EdgeHit>> {
    let rows = sqlx::query(&format!(
        "SELECT e.kind AS edge_kind, c.id, c.file_id, f.snapshot_id, f.rel_path, f.language, \
         f.category, c.content_hash, c.start_byte, c.end_byte, c.start_line, c.end_line, c.metadata \
         FROM edges e JOIN chunks c ON c.id = e.source_chunk_id \
         JOIN files f ON f.id = c.file_id \
         WHERE e.target_chunk_id = ? AND e.kind IN {GRAPH_KINDS} LIMIT ?"
    ))
    .bind(chunk_id)
    .bind(limit)
    .fetch_all(db.as_ref())
    .await?;
    rows.iter()
        .map(|row| {
            Ok(EdgeHit {
                kind: RelationKind::parse(row.get("edge_kind"))?,
                chunk: ChunkRow::from_row(row),
            })
        })
        .collect()
}

/// Chunks this one points at through non-structural edges.
pub async fn outgoing_calls(db: &SqlDb, chunk_id: i64, limit: i64) -> EngineResult<Vec<EdgeHit>> {
    let rows = sqlx::query(&format!(
        "SELECT e.kind AS edge_kind, c.id, c.file_id, f.snapshot_id, f.rel_path, f.language, \
         f.category, c.content_hash, c.start_byte, c.end_byte, c.start_line, c.end_line, c.metadata \
         FROM edges e JOIN chunks c ON c.id = e.target_chunk_id \
         JOIN files f ON f.id = c.file_id \
         WHERE e.source_chunk_id = ? AND e.kind IN {GRAPH_KINDS} LIMIT ?"
    ))
    .bind(chunk_id)
    .bind(limit)
    .fetch_all(db.as_ref())
    .await?;
    rows.iter()
        .map(|row| {
            Ok(EdgeHit {
                kind: RelationKind::parse(row.get("edge_kind"))?,
                chunk: ChunkRow::from_row(row),
            })
        })
        .collect()
}

/// Definition-bearing edges only; what the retrieval walker surfaces.
const DEFINITION_KINDS: &str = "('calls', 'references', 'defines')";

/// Chunks this one points at through `calls`/`references`/`defines` edges,
/// in edge order.
pub async fn outgoing_definitions(
    db: &SqlDb,
    chunk_id: i64,
    limit: i64,
) -> EngineResult<Vec<EdgeHit>> {
    let rows = sqlx::query(&format!(
        "SELECT e.kind AS edge_kind, c.id, c.file_id, f.snapshot_id, f.rel_path, f.language, \
         f.category, c.content_hash, c.start_byte, c.end_byte, c.start_line, c.end_line, c.metadata \
         FROM edges e JOIN chunks c ON c.id = e.target_chunk_id \
         JOIN files f ON f.id = c.file_id \
         WHERE e.source_chunk_id = ? AND e.kind IN {DEFINITION_KINDS} \
         ORDER BY e.id LIMIT ?"
    ))
    .bind(chunk_id)
    .bind(limit)
    .fetch_all(db.as_ref())
    .await?;
    rows.iter()
        .map(|row| {
            Ok(EdgeHit {
                kind: RelationKind::parse(row.get("edge_kind"))?,
                chunk: ChunkRow::from_row(row),
            })
        })
        .collect()
}

/// Symbol names arriving through incoming `calls`/`references`/`defines`
/// edges, deduplicated in edge order. Feeds the embedding prompt, so the
/// ordering must be deterministic for a given graph.
pub async fn incoming_symbol_names(
    db: &SqlDb,
    chunk_id: i64,
    limit: i64,
) -> EngineResult<Vec<String>> {
    let rows = sqlx::query(&format!(
        "SELECT c.metadata FROM edges e JOIN chunks c ON c.id = e.source_chunk_id \
         WHERE e.target_chunk_id = ? AND e.kind IN {DEFINITION_KINDS} \
         ORDER BY e.id LIMIT ?"
    ))
    .bind(chunk_id)
    .bind(limit)
    .fetch_all(db.as_ref())
    .await?;

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for row in rows {
        let metadata: String = row.get("metadata");
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap_or_default();
        let Some(identifiers) = metadata.get("identifiers").and_then(|v| v.as_array()) else {
            continue;
        };
        for value in identifiers {
            if let Some(name) = value.as_str() {
                if seen.insert(name.to_owned()) {
                    names.push(name.to_owned());
                }
            }
        }
    }
    Ok(names)
}

/// The chunk right before or after this one in source order.
pub async fn neighbor(
    db: &SqlDb,
    chunk_id: i64,
    next: bool,
) -> EngineResult<Option<ChunkRow>> {
    let Some(chunk) = chunk_by_id(db, chunk_id).await? else {
        return Ok(None);
    };
    let query = if next {
        format!(
            "{CHUNK_SELECT} WHERE c.file_id = ? AND c.start_byte > ? \
             ORDER BY c.start_byte ASC LIMIT 1"
        )
    } else {
        format!(
            "{CHUNK_SELECT} WHERE c.file_id = ? AND c.start_byte < ? \
             ORDER BY c.start_byte DESC LIMIT 1"
        )
    };
    let row = sqlx::query(&query)
        .bind(chunk.file_id)
        .bind(chunk.start_byte)
        .fetch_optional(db.as_ref())
        .await?;
    Ok(row.as_ref().map(ChunkRow::from_row))
}

/// One row of the externally produced cross-file relation feed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CrossFileRelation {
    pub source_path: String,
    pub source_start: i64,
    pub source_end: i64,
    pub target_path: String,
    pub target_start: i64,
    pub target_end: i64,
    pub relation: RelationKind,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RelationIngestReport {
    pub resolved: usize,
    pub file_fallback: usize,
    pub dropped: usize,
}

async fn resolve_endpoint(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot_id: i64,
    rel_path: &str,
    start: i64,
    end: i64,
) -> EngineResult<Option<(NodeRef, bool)>> {
    let file = sqlx::query("SELECT id FROM files WHERE snapshot_id = ? AND rel_path = ?")
        .bind(snapshot_id)
        .bind(rel_path)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(file) = file else {
        return Ok(None);
    };
    let file_id: i64 = file.get("id");

    let exact = sqlx::query(
        "SELECT id FROM chunks WHERE file_id = ? AND start_byte = ? AND end_byte = ?",
    )
    .bind(file_id)
    .bind(start)
    .bind(end)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = exact {
        return Ok(Some((NodeRef::Chunk(row.get("id")), false)));
    }

    let containing = sqlx::query(
        "SELECT id FROM chunks WHERE file_id = ? AND start_byte <= ? AND end_byte >= ? \
         ORDER BY end_byte - start_byte ASC LIMIT 1",
    )
    .bind(file_id)
    .bind(start)
    .bind(end)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = containing {
        return Ok(Some((NodeRef::Chunk(row.get("id")), false)));
    }

    Ok(Some((NodeRef::File(file_id), true)))
}

/// Resolve externally produced byte-range relations to graph edges.
///
/// Endpoints resolve by exact `(file, byte_range)` match, then by the
/// smallest chunk containing the range; ranges outside any chunk attach to
/// the file-level pseudo-node and are counted. Rows naming a path that does
/// not exist in the snapshot are dropped with a counted warning.
pub async fn ingest_cross_file_relations(
    db: &SqlDb,
    snapshot_id: i64,
    rows: &[CrossFileRelation],
) -> EngineResult<RelationIngestReport> {
    let mut report = RelationIngestReport::default();
    let mut seen: HashSet<(NodeRef, NodeRef, RelationKind)> = HashSet::new();
    let mut tx = db.begin().await?;

    for relation in rows {
        let source = resolve_endpoint(
            &mut tx,
            snapshot_id,
            &relation.source_path,
            relation.source_start,
            relation.source_end,
        )
        .await?;
        let target = resolve_endpoint(
            &mut tx,
            snapshot_id,
            &relation.target_path,
            relation.target_start,
            relation.target_end,
        )
        .await?;

        let (Some((source, source_fell_back)), Some((target, target_fell_back))) =
            (source, target)
        else {
            report.dropped += 1;
            warn!(
                source = %relation.source_path,
                target = %relation.target_path,
                "relation endpoint names no file in snapshot, dropping"
            );
            continue;
        };

        if !seen.insert((source, target, relation.relation)) {
            continue;
        }
        if source_fell_back || target_fell_back {
            report.file_fallback += 1;
        }

        let (source_chunk, source_file) = source.columns();
        let (target_chunk, target_file) = target.columns();
        sqlx::query(
            "INSERT OR IGNORE INTO edges \
             (snapshot_id, source_chunk_id, source_file_id, target_chunk_id, target_file_id, kind) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(snapshot_id)
        .bind(source_chunk)
        .bind(source_file)
        .bind(target_chunk)
        .bind(target_file)
        .bind(relation.relation.as_str())
        .execute(&mut *tx)
        .await?;
        report.resolved += 1;
    }

    tx.commit().await?;
    debug!(
        snapshot_id,
        resolved = report.resolved,
        file_fallback = report.file_fallback,
        dropped = report.dropped,
        "cross-file relations ingested"
    );
    Ok(report)
}
