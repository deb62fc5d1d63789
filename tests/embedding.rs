mod common;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use lattice::db::staging::begin_embedding_run;
use lattice::db::{EngineError, EngineResult};
use lattice::embedder::pipeline::{EmbedEvent, EmbeddingPipeline};
use lattice::embedder::Embedder;

const A_PY: &str = "def foo():\n    return \"marker-value-from-foo\"\n";
const B_PY: &str = "from a import foo\n\nresult = foo()\n";
const C_MD: &str = "# Demo\n\nsome documentation\n";

#[tokio::test]
async fn embeddings_are_cached_across_snapshots() {
    let mut fixture = common::index_fixture(
        "embed-cache",
        &[("a.py", A_PY), ("b.py", B_PY), ("c.md", C_MD)],
        &[],
    )
    .await;

    let embedder = common::FakeEmbedder::new();
    let pipeline = EmbeddingPipeline::new(fixture.db.clone(), embedder.clone(), 1, 2);
    let first_snapshot = fixture.snapshot_id;

    // fresh run: one provider call per chunk (batch size 1, two chunks)
    let summary = pipeline.run_to_completion(first_snapshot).await.unwrap();
    assert_eq!(summary.newly_embedded, 2);
    assert_eq!(summary.reused, 0);
    assert_eq!(embedder.calls(), 2);

    // same snapshot again: nothing to stage, no provider traffic
    let summary = pipeline.run_to_completion(first_snapshot).await.unwrap();
    assert_eq!(summary.newly_embedded, 0);
    assert_eq!(embedder.calls(), 2);

    // a commit that only touches c.md: both vectors backfill from cache
    common::write_files(&fixture.repo_dir, &[("c.md", "# Demo\n\nedited docs\n")]);
    common::commit_all(&fixture.repo_dir, "touch docs");
    let second_snapshot = fixture.reindex().await;
    assert_ne!(second_snapshot, first_snapshot);

    let summary = pipeline.run_to_completion(second_snapshot).await.unwrap();
    assert_eq!(summary.newly_embedded, 0);
    assert_eq!(summary.reused, 2);
    assert_eq!(embedder.calls(), 2);
}

#[tokio::test]
async fn event_stream_reports_the_stage_order() {
    let fixture =
        common::index_fixture("embed-events", &[("a.py", A_PY), ("b.py", B_PY)], &[]).await;
    let embedder = common::FakeEmbedder::new();
    let pipeline = EmbeddingPipeline::new(fixture.db.clone(), embedder, 8, 2);

    let stream = pipeline.run(fixture.snapshot_id);
    futures::pin_mut!(stream);
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.unwrap());
    }

    assert_eq!(events.first(), Some(&EmbedEvent::Init));
    assert!(events.contains(&EmbedEvent::Deduplicating));
    let progress_at = events
        .iter()
        .position(|e| matches!(e, EmbedEvent::EmbeddingProgress { .. }))
        .expect("progress events");
    let completed_at = events
        .iter()
        .position(|e| matches!(e, EmbedEvent::Completed { .. }))
        .expect("completed event");
    assert!(progress_at < completed_at);
    assert_eq!(completed_at, events.len() - 1);

    match events[completed_at] {
        EmbedEvent::Completed {
            newly_embedded,
            reused,
            errored,
        } => {
            assert_eq!(newly_embedded, 2);
            assert_eq!(reused, 0);
            assert_eq!(errored, 0);
        }
        _ => unreachable!(),
    }
}

struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn batch_embed(&self, _texts: Vec<&str>) -> EngineResult<Vec<Vec<f32>>> {
        Err(EngineError::Data("provider rejected the batch".into()))
    }

    fn dimension(&self) -> usize {
        8
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }
}

#[tokio::test]
async fn failed_batches_are_counted_but_do_not_fail_the_run() {
    let fixture =
        common::index_fixture("embed-broken", &[("a.py", A_PY), ("b.py", B_PY)], &[]).await;
    let pipeline = EmbeddingPipeline::new(fixture.db.clone(), Arc::new(BrokenEmbedder), 1, 2);

    let summary = pipeline.run_to_completion(fixture.snapshot_id).await.unwrap();
    assert_eq!(summary.newly_embedded, 0);
    assert_eq!(summary.errored, 2);
}

#[tokio::test]
async fn concurrent_runs_on_one_snapshot_are_excluded() {
    let fixture = common::index_fixture("embed-lock", &[("a.py", A_PY)], &[]).await;

    // simulate an in-flight run holding the coordination row
    begin_embedding_run(&fixture.db, fixture.snapshot_id, "fake-model")
        .await
        .unwrap();

    let embedder = common::FakeEmbedder::new();
    let pipeline = EmbeddingPipeline::new(fixture.db.clone(), embedder, 1, 2);
    let result = pipeline.run_to_completion(fixture.snapshot_id).await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}
