use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rayon::prelude::*;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::application::background::Pipes;
use crate::application::config::configuration::Configuration;
use crate::chunking::languages::TSLanguageParsing;
use crate::chunking::parse::{parse_file, ParsedFile};
use crate::db::bulk::{write_parsed_file, ParsedFileWrite};
use crate::db::graph::{self, ingest_cross_file_relations, CrossFileRelation};
use crate::db::repositories::ensure_repository;
use crate::db::snapshots::{activate_snapshot, create_snapshot, fail_snapshot};
use crate::db::{EngineError, EngineResult, SqlDb};
use crate::fts::{FtsDoc, FtsIndex};
use crate::relations::RelationSource;
use crate::repo::collector::GitCollector;
use crate::repo::sync::RepoManager;
use crate::repo::types::{FileDescriptor, RepoRef};

use super::stats::{build_manifest, SnapshotStats};

const FTS_FLUSH_DOCS: usize = 256;

#[derive(Debug)]
pub enum IndexOutcome {
    /// Another indexing run holds the advisory lock.
    Queued,
    /// The commit already has a completed snapshot.
    Reused { snapshot_id: i64 },
    Indexed {
        snapshot_id: i64,
        stats: SnapshotStats,
    },
}

/// Drives one indexing run from snapshot creation to activation.
pub struct IndexerOrchestrator {
    config: Arc<Configuration>,
    db: SqlDb,
    fts: Arc<FtsIndex>,
    languages: Arc<TSLanguageParsing>,
    repos: Arc<RepoManager>,
    relation_sources: Vec<Arc<dyn RelationSource>>,
}

impl IndexerOrchestrator {
    pub fn new(
        config: Arc<Configuration>,
        db: SqlDb,
        fts: Arc<FtsIndex>,
        languages: Arc<TSLanguageParsing>,
        repos: Arc<RepoManager>,
        relation_sources: Vec<Arc<dyn RelationSource>>,
    ) -> Self {
        Self {
            config,
            db,
            fts,
            languages,
            repos,
            relation_sources,
        }
    }

    pub async fn index(
        &self,
        repo: &RepoRef,
        display_name: &str,
        force_new: bool,
        pipes: &Pipes,
    ) -> EngineResult<IndexOutcome> {
        let repo_id = ensure_repository(&self.db, &repo.url, &repo.branch, display_name).await?;

        self.repos.update_mirror(repo).await?;
        let commit_hash = self.repos.resolve_commit(repo).await?;

        let (snapshot_id, created) =
            create_snapshot(&self.db, repo_id, &commit_hash, force_new).await?;
        let Some(snapshot_id) = snapshot_id else {
            return Ok(IndexOutcome::Queued);
        };
        if !created {
            return Ok(IndexOutcome::Reused { snapshot_id });
        }

        pipes.status_change("indexing");
        let worktree = match self.repos.create_worktree(repo, &commit_hash, snapshot_id).await {
            Ok(worktree) => worktree,
            Err(err) => {
                let _ = fail_snapshot(&self.db, snapshot_id, &err.to_string()).await;
                return Err(err);
            }
        };

        let result = self
            .run_snapshot(repo_id, snapshot_id, &worktree, pipes)
            .await;
        if let Err(err) = self.repos.remove_worktree(repo, snapshot_id).await {
            warn!(snapshot_id, %err, "failed to remove worktree");
        }

        match result {
            Ok(stats) => {
                pipes.status_change("completed");
                Ok(IndexOutcome::Indexed { snapshot_id, stats })
            }
            Err(err) => {
                pipes.status_change("failed");
                if let Err(fail_err) = fail_snapshot(&self.db, snapshot_id, &err.to_string()).await
                {
                    warn!(snapshot_id, %fail_err, "could not mark snapshot failed");
                }
                // drop search documents buffered before the failure
                if let Err(fts_err) = self.fts.delete_snapshot(snapshot_id).await {
                    warn!(snapshot_id, %fts_err, "failed to drop search documents");
                }
                Err(err)
            }
        }
    }

    async fn run_snapshot(
        &self,
        repo_id: i64,
        snapshot_id: i64,
        worktree: &Path,
        pipes: &Pipes,
    ) -> EngineResult<SnapshotStats> {
        let mut stats = SnapshotStats::default();

        // Cache-first split: files whose blob hash already has a parsed
        // record in a completed snapshot re-attach without parse work.
        let collector = GitCollector::new(worktree, self.config.max_file_size);
        let batches = collector.stream_files(self.config.files_per_task).await?;

        let mut misses: Vec<FileDescriptor> = Vec::new();
        let mut fts_buffer: Vec<FtsDoc> = Vec::new();

        for batch in batches {
            if pipes.is_cancelled() {
                return Err(EngineError::Data("indexing cancelled".into()));
            }
            stats.files_total += batch.len();

            let cached = self.lookup_cached(repo_id, &batch).await?;
            for descriptor in batch {
                let hit = descriptor
                    .git_hash
                    .as_deref()
                    .and_then(|hash| cached.get(hash).copied());
                match hit {
                    Some(old_file_id) => {
                        self.reattach(snapshot_id, &descriptor, old_file_id, &mut stats, &mut fts_buffer)
                            .await?;
                        stats.cache_hits += 1;
                    }
                    None => misses.push(descriptor),
                }
            }
            self.maybe_flush_fts(&mut fts_buffer, false).await?;
        }

        let total_misses = misses.len();
        debug!(
            snapshot_id,
            cache_hits = stats.cache_hits,
            misses = total_misses,
            "cache-first split complete"
        );

        // Relation extraction runs while the parse pool drains.
        let relations_future = self.collect_relations(worktree);
        let parse_future = self.parse_and_write(snapshot_id, misses, pipes, &mut stats, &mut fts_buffer);
        let (parse_result, relation_rows) = futures::join!(parse_future, relations_future);
        parse_result?;

        if pipes.is_cancelled() {
            return Err(EngineError::Data("indexing cancelled".into()));
        }

        // All chunks are committed before resolution starts.
        if !relation_rows.is_empty() {
            let report = ingest_cross_file_relations(&self.db, snapshot_id, &relation_rows).await?;
            stats.cross_file_edges = report.resolved;
            stats.relations_file_fallback = report.file_fallback;
            stats.relations_dropped = report.dropped;
        }

        self.maybe_flush_fts(&mut fts_buffer, true).await?;

        let manifest = self.build_snapshot_manifest(snapshot_id).await?;
        let stats_json = serde_json::to_value(stats).map_err(anyhow::Error::from)?;
        let pruned =
            activate_snapshot(&self.db, repo_id, snapshot_id, &stats_json, &manifest).await?;
        for stale in pruned {
            self.fts.delete_snapshot(stale).await?;
        }
        pipes.index_percent(100);
        info!(snapshot_id, files = stats.files_total, chunks = stats.chunks, "snapshot indexed");
        Ok(stats)
    }

    /// Latest completed-snapshot file record per git blob hash.
    async fn lookup_cached(
        &self,
        repo_id: i64,
        batch: &[FileDescriptor],
    ) -> EngineResult<HashMap<String, i64>> {
        let hashes: Vec<&str> = batch
            .iter()
            .filter_map(|d| d.git_hash.as_deref())
            .collect();
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; hashes.len()].join(", ");
        let sql = format!(
            "SELECT f.id, f.git_hash FROM files f \
             JOIN snapshots s ON s.id = f.snapshot_id \
             WHERE s.repository_id = ? AND s.status = 'completed' AND f.git_hash IN ({placeholders}) \
             ORDER BY s.created_at DESC"
        );
        let mut query = sqlx::query(&sql).bind(repo_id);
        for hash in &hashes {
            query = query.bind(*hash);
        }
        let rows = query.fetch_all(self.db.as_ref()).await?;

        let mut cached = HashMap::new();
        for row in rows {
            let git_hash: String = row.get("git_hash");
            cached.entry(git_hash).or_insert_with(|| row.get("id"));
        }
        Ok(cached)
    }

    /// Copy a prior snapshot's record of an unchanged blob into the new
    /// snapshot: file row, chunks, intra-file edges, and search documents.
    async fn reattach(
        &self,
        snapshot_id: i64,
        descriptor: &FileDescriptor,
        old_file_id: i64,
        stats: &mut SnapshotStats,
        fts_buffer: &mut Vec<FtsDoc>,
    ) -> EngineResult<()> {
        let old_file = graph::file_by_id(&self.db, old_file_id)
            .await?
            .ok_or_else(|| EngineError::Data(format!("cached file {old_file_id} vanished")))?;
        let old_chunks = graph::chunks_of_file(&self.db, old_file_id).await?;

        let index_of: HashMap<i64, usize> = old_chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();
        let mut edges = Vec::new();
        if !old_chunks.is_empty() {
            let placeholders = vec!["?"; old_chunks.len()].join(", ");
            let sql = format!(
                "SELECT source_chunk_id, target_chunk_id FROM edges \
                 WHERE kind = 'child_of' AND source_chunk_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for chunk in &old_chunks {
                query = query.bind(chunk.id);
            }
            for row in query.fetch_all(self.db.as_ref()).await? {
                let source: i64 = row.get("source_chunk_id");
                let target: Option<i64> = row.get("target_chunk_id");
                if let (Some(&s), Some(&t)) = (
                    index_of.get(&source),
                    target.and_then(|t| index_of.get(&t)),
                ) {
                    edges.push((s, t, graph::RelationKind::ChildOf));
                }
            }
        }

        let write = ParsedFileWrite {
            file: crate::db::bulk::NewFile {
                snapshot_id,
                rel_path: descriptor.rel_path.clone(),
                language: old_file.language.clone(),
                size: old_file.size,
                category: descriptor.category.as_str().to_owned(),
                git_hash: descriptor.git_hash.clone(),
                parsing_status: old_file.parsing_status.clone(),
                content_hash: old_file.content_hash.clone(),
            },
            contents: Vec::new(),
            chunks: old_chunks
                .iter()
                .map(|c| crate::db::bulk::NewChunk {
                    file_id: 0,
                    content_hash: c.content_hash.clone(),
                    start_byte: c.start_byte,
                    end_byte: c.end_byte,
                    start_line: c.start_line,
                    end_line: c.end_line,
                    metadata: c.metadata.clone(),
                })
                .collect(),
            edges,
        };
        let edge_count = write.edges.len();
        let (file_id, chunk_ids) = write_parsed_file(&self.db, write).await?;
        stats.chunks += chunk_ids.len();
        stats.intra_file_edges += edge_count;
        match old_file.parsing_status.as_str() {
            "parsed" => stats.files_parsed += 1,
            "failed" => stats.files_failed += 1,
            _ => stats.files_skipped += 1,
        }

        if old_chunks.is_empty() {
            fts_buffer.push(FtsDoc {
                chunk_id: None,
                snapshot_id,
                file_id,
                rel_path: descriptor.rel_path.clone(),
                language: old_file.language.clone(),
                category: descriptor.category.as_str().to_owned(),
                roles: vec![descriptor.category.as_str().to_owned()],
                tags: old_file.language.iter().cloned().collect(),
                content: String::new(),
            });
        }
        for (chunk, chunk_id) in old_chunks.iter().zip(&chunk_ids) {
            let text = graph::content_text(&self.db, &chunk.content_hash)
                .await?
                .unwrap_or_default();
            let roles = chunk.tags();
            let mut tags = roles.clone();
            tags.extend(chunk.identifiers());
            fts_buffer.push(FtsDoc {
                chunk_id: Some(*chunk_id),
                snapshot_id,
                file_id,
                rel_path: descriptor.rel_path.clone(),
                language: old_file.language.clone(),
                category: descriptor.category.as_str().to_owned(),
                roles,
                tags,
                content: text,
            });
        }
        Ok(())
    }

    /// Fan the misses out over the parse pool and stream results into
    /// per-file atomic writes.
    async fn parse_and_write(
        &self,
        snapshot_id: i64,
        misses: Vec<FileDescriptor>,
        pipes: &Pipes,
        stats: &mut SnapshotStats,
        fts_buffer: &mut Vec<FtsDoc>,
    ) -> EngineResult<()> {
        if misses.is_empty() {
            return Ok(());
        }

        let total = misses.len();
        let (tx, rx) = flume::bounded::<ParsedFile>(self.config.files_per_task * 2);
        let languages = self.languages.clone();
        let worker_pipes = pipes.clone();
        let workers = self.config.max_workers.max(1);

        let parse_handle = tokio::task::spawn_blocking(move || {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .context("failed to build parse pool")?;
            pool.install(|| {
                misses
                    .into_par_iter()
                    .take_any_while(|_| !worker_pipes.is_cancelled())
                    .for_each_with(tx, |tx, descriptor| {
                        let bytes = match std::fs::read(&descriptor.full_path) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                warn!(path = %descriptor.rel_path, %err, "read failed, dropping file");
                                return;
                            }
                        };
                        let parsed = parse_file(snapshot_id, &descriptor, &bytes, &languages);
                        let _ = tx.send(parsed);
                    });
            });
            Ok::<_, anyhow::Error>(())
        });

        let mut processed = 0usize;
        while let Ok(parsed) = rx.recv_async().await {
            self.write_parsed(snapshot_id, parsed, stats, fts_buffer).await?;
            processed += 1;
            pipes.index_percent(((processed as f32 / total as f32) * 100.0) as u8);
            self.maybe_flush_fts(fts_buffer, false).await?;
        }

        parse_handle
            .await
            .map_err(|err| anyhow!("parse pool panicked: {err}"))??;
        Ok(())
    }

    async fn write_parsed(
        &self,
        snapshot_id: i64,
        parsed: ParsedFile,
        stats: &mut SnapshotStats,
        fts_buffer: &mut Vec<FtsDoc>,
    ) -> EngineResult<()> {
        match parsed.file.parsing_status.as_str() {
            "parsed" => stats.files_parsed += 1,
            "failed" => stats.files_failed += 1,
            _ => stats.files_skipped += 1,
        }
        stats.contents += parsed.contents.len();
        stats.intra_file_edges += parsed.edges.len();

        let rel_path = parsed.file.rel_path.clone();
        let language = parsed.file.language.clone();
        let category = parsed.file.category.clone();
        let fts_drafts = parsed.fts;

        let write = ParsedFileWrite {
            file: parsed.file,
            contents: parsed.contents,
            chunks: parsed.chunks,
            edges: parsed.edges,
        };
        let (file_id, chunk_ids) = write_parsed_file(&self.db, write).await?;
        stats.chunks += chunk_ids.len();

        for draft in fts_drafts {
            let chunk_id = draft.chunk_index.map(|i| chunk_ids[i]);
            fts_buffer.push(FtsDoc {
                chunk_id,
                snapshot_id,
                file_id,
                rel_path: rel_path.clone(),
                language: language.clone(),
                category: category.clone(),
                roles: draft.roles,
                tags: draft.tags,
                content: draft.content,
            });
        }
        Ok(())
    }

    async fn maybe_flush_fts(&self, buffer: &mut Vec<FtsDoc>, force: bool) -> EngineResult<()> {
        if buffer.is_empty() || (!force && buffer.len() < FTS_FLUSH_DOCS) {
            return Ok(());
        }
        let docs = std::mem::take(buffer);
        self.fts.add_documents(&docs).await
    }

    /// Every configured relation source, failures logged and skipped.
    async fn collect_relations(&self, worktree: &Path) -> Vec<CrossFileRelation> {
        let mut rows = Vec::new();
        for source in &self.relation_sources {
            match source.relations(worktree).await {
                Ok(mut source_rows) => rows.append(&mut source_rows),
                Err(err) => {
                    warn!(source = source.name(), %err, "relation source failed, continuing without it");
                }
            }
        }
        rows
    }

    async fn build_snapshot_manifest(&self, snapshot_id: i64) -> EngineResult<serde_json::Value> {
        let rows = sqlx::query("SELECT rel_path FROM files WHERE snapshot_id = ? ORDER BY rel_path")
            .bind(snapshot_id)
            .fetch_all(self.db.as_ref())
            .await?;
        let paths: Vec<String> = rows.iter().map(|row| row.get("rel_path")).collect();
        let manifest = build_manifest(&paths);
        Ok(serde_json::to_value(manifest).map_err(anyhow::Error::from)?)
    }
}
