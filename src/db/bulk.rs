use sqlx::{Row, Sqlite, Transaction};

use super::graph::{NodeRef, RelationKind};
use super::{EngineResult, SqlDb};

#[derive(Debug, Clone)]
pub struct NewFile {
    pub snapshot_id: i64,
    pub rel_path: String,
    pub language: Option<String>,
    pub size: i64,
    pub category: String,
    pub git_hash: Option<String>,
    pub parsing_status: String,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewContent {
    pub hash: String,
    pub text: String,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub file_id: i64,
    pub content_hash: String,
    pub start_byte: i64,
    pub end_byte: i64,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewEdge {
    pub snapshot_id: i64,
    pub source: NodeRef,
    pub target: NodeRef,
    pub kind: RelationKind,
    pub metadata: Option<serde_json::Value>,
}

async fn insert_file(tx: &mut Transaction<'_, Sqlite>, file: &NewFile) -> EngineResult<i64> {
    sqlx::query(
        "INSERT INTO files \
         (snapshot_id, rel_path, language, size, category, git_hash, parsing_status, content_hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (snapshot_id, rel_path) DO NOTHING",
    )
    .bind(file.snapshot_id)
    .bind(&file.rel_path)
    .bind(&file.language)
    .bind(file.size)
    .bind(&file.category)
    .bind(&file.git_hash)
    .bind(&file.parsing_status)
    .bind(&file.content_hash)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query("SELECT id FROM files WHERE snapshot_id = ? AND rel_path = ?")
        .bind(file.snapshot_id)
        .bind(&file.rel_path)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.get("id"))
}

async fn insert_contents(
    tx: &mut Transaction<'_, Sqlite>,
    contents: &[NewContent],
) -> EngineResult<()> {
    for content in contents {
        sqlx::query(
            "INSERT INTO contents (hash, text, size) VALUES (?, ?, ?) \
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(&content.hash)
        .bind(&content.text)
        .bind(content.size)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &NewChunk) -> EngineResult<i64> {
    sqlx::query(
        "INSERT INTO chunks \
         (file_id, content_hash, start_byte, end_byte, start_line, end_line, metadata) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (file_id, start_byte, end_byte) DO NOTHING",
    )
    .bind(chunk.file_id)
    .bind(&chunk.content_hash)
    .bind(chunk.start_byte)
    .bind(chunk.end_byte)
    .bind(chunk.start_line)
    .bind(chunk.end_line)
    .bind(chunk.metadata.to_string())
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        "SELECT id FROM chunks WHERE file_id = ? AND start_byte = ? AND end_byte = ?",
    )
    .bind(chunk.file_id)
    .bind(chunk.start_byte)
    .bind(chunk.end_byte)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}

async fn insert_edge(tx: &mut Transaction<'_, Sqlite>, edge: &NewEdge) -> EngineResult<()> {
    let (source_chunk, source_file) = edge.source.columns();
    let (target_chunk, target_file) = edge.target.columns();
    sqlx::query(
        "INSERT OR IGNORE INTO edges \
         (snapshot_id, source_chunk_id, source_file_id, target_chunk_id, target_file_id, kind, metadata) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(edge.snapshot_id)
    .bind(source_chunk)
    .bind(source_file)
    .bind(target_chunk)
    .bind(target_file)
    .bind(edge.kind.as_str())
    .bind(edge.metadata.as_ref().map(|m| m.to_string()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Bulk-insert files with set semantics; returns ids in input order.
pub async fn add_files(db: &SqlDb, files: &[NewFile]) -> EngineResult<Vec<i64>> {
    let mut tx = db.begin().await?;
    let mut ids = Vec::with_capacity(files.len());
    for file in files {
        ids.push(insert_file(&mut tx, file).await?);
    }
    tx.commit().await?;
    Ok(ids)
}

/// Bulk-insert contents; rows already present (by hash) are left untouched.
pub async fn add_contents(db: &SqlDb, contents: &[NewContent]) -> EngineResult<()> {
    let mut tx = db.begin().await?;
    insert_contents(&mut tx, contents).await?;
    tx.commit().await?;
    Ok(())
}

/// Bulk-insert chunks with set semantics; returns ids in input order.
pub async fn add_chunks(db: &SqlDb, chunks: &[NewChunk]) -> EngineResult<Vec<i64>> {
    let mut tx = db.begin().await?;
    let mut ids = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        ids.push(insert_chunk(&mut tx, chunk).await?);
    }
    tx.commit().await?;
    Ok(ids)
}

/// Bulk-insert edges; duplicate `(source, target, kind)` triples collapse.
pub async fn add_edges(db: &SqlDb, edges: &[NewEdge]) -> EngineResult<()> {
    let mut tx = db.begin().await?;
    for edge in edges {
        insert_edge(&mut tx, edge).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Everything one parsed file contributes, committed as a unit: the file
/// row, its content blobs, its chunks in source order, and the intra-file
/// edges referencing chunks by index into `chunks`.
pub struct ParsedFileWrite {
    pub file: NewFile,
    pub contents: Vec<NewContent>,
    pub chunks: Vec<NewChunk>,
    pub edges: Vec<(usize, usize, RelationKind)>,
}

pub async fn write_parsed_file(
    db: &SqlDb,
    mut write: ParsedFileWrite,
) -> EngineResult<(i64, Vec<i64>)> {
    let mut tx = db.begin().await?;

    insert_contents(&mut tx, &write.contents).await?;
    let file_id = insert_file(&mut tx, &write.file).await?;

    let mut chunk_ids = Vec::with_capacity(write.chunks.len());
    for chunk in &mut write.chunks {
        chunk.file_id = file_id;
        chunk_ids.push(insert_chunk(&mut tx, chunk).await?);
    }

    let snapshot_id = write.file.snapshot_id;
    for (source_idx, target_idx, kind) in &write.edges {
        let edge = NewEdge {
            snapshot_id,
            source: NodeRef::Chunk(chunk_ids[*source_idx]),
            target: NodeRef::Chunk(chunk_ids[*target_idx]),
            kind: *kind,
            metadata: None,
        };
        insert_edge(&mut tx, &edge).await?;
    }

    tx.commit().await?;
    Ok((file_id, chunk_ids))
}
