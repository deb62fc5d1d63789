use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::db::error::retry;
use crate::db::graph;
use crate::db::staging::{
    begin_embedding_run, bulk_load_staging, copy_cached_vectors, count_staging_delta,
    fetch_staging_delta, fetch_unembedded, finish_embedding_run, mark_errored, prepare_staging,
    promote_staging, StagingRow,
};
use crate::db::vectors::encode_vector;
use crate::db::{staging, EngineError, EngineResult, SqlDb};

use super::prompt::{build_prompt, vector_hash};
use super::Embedder;

const STAGE_PAGE_SIZE: i64 = 500;
/// Incoming symbol names carried into one prompt.
const MAX_PROMPT_SYMBOLS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmbedEvent {
    Init,
    StagingProgress { staged: usize },
    Deduplicating,
    EmbeddingProgress { processed: usize, total: usize },
    Completed { newly_embedded: usize, reused: usize, errored: usize },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedSummary {
    pub newly_embedded: usize,
    pub reused: usize,
    pub errored: usize,
}

type EventSender = flume::Sender<EngineResult<EmbedEvent>>;

/// The staged, content-addressed embedding pipeline: stage unembedded
/// chunks, backfill cached vectors by prompt hash, push the delta through
/// the provider in bounded-concurrency batches, promote.
pub struct EmbeddingPipeline {
    db: SqlDb,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    max_concurrency: usize,
}

impl EmbeddingPipeline {
    pub fn new(
        db: SqlDb,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            db,
            embedder,
            batch_size: batch_size.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run the pipeline as a sequence of status events produced by a
    /// cooperative task. Dropping the stream stops the task at its next
    /// event boundary; staged rows keep whatever was written and the next
    /// run resumes cleanly.
    pub fn run(
        &self,
        snapshot_id: i64,
    ) -> impl futures::Stream<Item = EngineResult<EmbedEvent>> {
        let (tx, rx) = flume::unbounded();
        let db = self.db.clone();
        let embedder = self.embedder.clone();
        let batch_size = self.batch_size;
        let max_concurrency = self.max_concurrency;

        tokio::spawn(async move {
            let model = embedder.model_name().to_owned();
            if let Err(err) = begin_embedding_run(&db, snapshot_id, &model).await {
                let _ = tx.send(Err(err));
                return;
            }

            let result = run_stages(
                &db,
                embedder,
                &model,
                snapshot_id,
                batch_size,
                max_concurrency,
                &tx,
            )
            .await;

            if let Err(err) = finish_embedding_run(&db, snapshot_id, &model).await {
                warn!(snapshot_id, %err, "failed to release embedding run slot");
            }
            if let Err(err) = result {
                let _ = tx.send(Err(err));
            }
        });

        rx.into_stream()
    }

    /// Drain the event stream and return the completion figures.
    pub async fn run_to_completion(&self, snapshot_id: i64) -> EngineResult<EmbedSummary> {
        let stream = self.run(snapshot_id);
        futures::pin_mut!(stream);
        let mut summary = EmbedSummary::default();
        while let Some(event) = stream.next().await {
            if let EmbedEvent::Completed {
                newly_embedded,
                reused,
                errored,
            } = event?
            {
                summary = EmbedSummary {
                    newly_embedded,
                    reused,
                    errored,
                };
            }
        }
        Ok(summary)
    }
}

/// Consumer gone means cancellation: stop emitting and wind down.
fn emit(tx: &EventSender, event: EmbedEvent) -> bool {
    tx.send(Ok(event)).is_ok()
}

async fn run_stages(
    db: &SqlDb,
    embedder: Arc<dyn Embedder>,
    model: &str,
    snapshot_id: i64,
    batch_size: usize,
    max_concurrency: usize,
    tx: &EventSender,
) -> EngineResult<()> {
    if !emit(tx, EmbedEvent::Init) {
        return Ok(());
    }
    prepare_staging(db, snapshot_id, model).await?;

    // Stage: one row per chunk that lacks a vector for this model.
    let mut staged = 0usize;
    let mut after_chunk_id = 0i64;
    loop {
        let page =
            fetch_unembedded(db, snapshot_id, model, after_chunk_id, STAGE_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        after_chunk_id = page.last().map(|c| c.chunk_id).unwrap_or(after_chunk_id);

        let mut rows = Vec::with_capacity(page.len());
        for chunk in &page {
            let incoming =
                graph::incoming_symbol_names(db, chunk.chunk_id, MAX_PROMPT_SYMBOLS).await?;
            let prompt = build_prompt(chunk, &incoming);
            rows.push(StagingRow {
                chunk_id: chunk.chunk_id,
                model: model.to_owned(),
                snapshot_id: chunk.snapshot_id,
                file_id: chunk.file_id,
                vector_hash: vector_hash(&prompt),
                prompt,
            });
        }
        bulk_load_staging(db, &rows).await?;
        staged += rows.len();
        if !emit(tx, EmbedEvent::StagingProgress { staged }) {
            return Ok(());
        }
    }

    if !emit(tx, EmbedEvent::Deduplicating) {
        return Ok(());
    }
    let reused = copy_cached_vectors(db, snapshot_id, model).await? as usize;
    let total = count_staging_delta(db, snapshot_id, model).await? as usize;
    debug!(snapshot_id, staged, reused, delta = total, "staging complete");

    let mut processed = 0usize;
    let mut errored_rows = 0usize;
    if !emit(tx, EmbedEvent::EmbeddingProgress { processed, total }) {
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    loop {
        let deltas = fetch_staging_delta(
            db,
            snapshot_id,
            model,
            (batch_size * max_concurrency) as i64,
        )
        .await?;
        if deltas.is_empty() {
            break;
        }

        let batches: Vec<_> = deltas.chunks(batch_size).map(|batch| {
            let semaphore = semaphore.clone();
            let embedder = embedder.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Data("semaphore closed".into()))?;

                let outcome = retry("batch_embed", || {
                    let embedder = embedder.clone();
                    let texts: Vec<&str> = batch.iter().map(|d| d.prompt.as_str()).collect();
                    async move { embedder.batch_embed(texts).await }
                })
                .await;

                match outcome {
                    Ok(vectors) => {
                        let records: Vec<(i64, Vec<u8>)> = batch
                            .iter()
                            .zip(&vectors)
                            .map(|(delta, vector)| (delta.chunk_id, encode_vector(vector)))
                            .collect();
                        staging::write_vectors(db, model, &records).await?;
                        Ok::<(usize, usize), EngineError>((batch.len(), 0))
                    }
                    Err(err) => {
                        warn!(%err, batch = batch.len(), "embedding batch failed, marking rows errored");
                        let chunk_ids: Vec<i64> = batch.iter().map(|d| d.chunk_id).collect();
                        mark_errored(db, model, &chunk_ids).await?;
                        Ok((0, batch.len()))
                    }
                }
            }
        }).collect();

        let results = futures::stream::iter(batches)
            .buffer_unordered(max_concurrency)
            .collect::<Vec<_>>()
            .await;
        for result in results {
            let (ok, failed) = result?;
            processed += ok;
            errored_rows += failed;
        }
        if !emit(tx, EmbedEvent::EmbeddingProgress { processed, total }) {
            return Ok(());
        }
    }

    let (promoted, _) = promote_staging(db, snapshot_id, model).await?;
    let newly_embedded = (promoted as usize).saturating_sub(reused);
    if errored_rows > 0 {
        warn!(snapshot_id, errored_rows, "some batches failed; rows left unembedded");
    }
    info!(snapshot_id, newly_embedded, reused, "embedding run complete");
    emit(
        tx,
        EmbedEvent::Completed {
            newly_embedded,
            reused,
            errored: errored_rows,
        },
    );
    Ok(())
}
