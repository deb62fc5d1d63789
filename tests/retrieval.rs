mod common;

use std::sync::Arc;

use lattice::db::filters::SearchFilters;
use lattice::db::EngineError;
use lattice::embedder::pipeline::EmbeddingPipeline;
use lattice::embedder::Embedder;
use lattice::reader::{NeighborDirection, SnapshotReader};
use lattice::retrieval::types::RetrievalMethod;
use lattice::retrieval::{RetrievalEngine, Strategy};

const A_PY: &str = "def foo():\n    \"\"\"Return a fixed marker string.\"\"\"\n    return \"marker-value-from-foo\"\n";
const B_PY: &str = "from a import foo\n\nresult = foo()\n";
const C_MD: &str = "# Demo\n\nsome documentation\n";

async fn embedded_fixture(label: &str) -> (common::TestEngine, Arc<common::FakeEmbedder>) {
    let call_offset = B_PY.find("foo()").unwrap();
    let feed = serde_json::json!({
        "source_path": "b.py",
        "source_start": call_offset,
        "source_end": call_offset + 5,
        "target_path": "a.py",
        "target_start": 0,
        "target_end": 20,
        "relation": "calls",
    });
    let fixture = common::index_fixture(
        label,
        &[("a.py", A_PY), ("b.py", B_PY), ("c.md", C_MD)],
        &[feed],
    )
    .await;

    let embedder = common::FakeEmbedder::new();
    EmbeddingPipeline::new(fixture.db.clone(), embedder.clone(), 8, 2)
        .run_to_completion(fixture.snapshot_id)
        .await
        .unwrap();
    (fixture, embedder)
}

#[tokio::test]
async fn hybrid_fuses_vector_and_keyword_ranks() {
    let (fixture, embedder) = embedded_fixture("hybrid").await;
    let engine = RetrievalEngine::new(
        fixture.db.clone(),
        fixture.fts.clone(),
        Some(embedder.clone() as std::sync::Arc<dyn Embedder>),
    );

    let results = engine
        .retrieve(
            "foo",
            fixture.repo_id,
            None,
            10,
            Strategy::Hybrid,
            &SearchFilters::default(),
        )
        .await
        .unwrap();

    // both python chunks mention foo, so both sit in the vector list and
    // the keyword list; their fused score must beat any single-list rank
    assert_eq!(results.len(), 2);
    let single_list_max = 1.0 / 61.0;
    for result in &results {
        assert_eq!(result.retrieval_method, RetrievalMethod::Hybrid);
        assert!(result.score > single_list_max);
    }

    // the caller chunk carries its resolved outgoing definition
    let caller = results
        .iter()
        .find(|r| r.file_path == "b.py")
        .expect("b.py in results");
    assert!(caller
        .outgoing_definitions
        .iter()
        .any(|d| d.relation == "calls" && d.name == "foo"));
}

#[tokio::test]
async fn keyword_search_needs_no_provider() {
    let (fixture, _) = embedded_fixture("keyword-only").await;
    let engine = RetrievalEngine::new(fixture.db.clone(), fixture.fts.clone(), None);

    let results = engine
        .retrieve(
            "foo",
            fixture.repo_id,
            None,
            10,
            Strategy::Keyword,
            &SearchFilters::default(),
        )
        .await
        .unwrap();
    assert!(!results.is_empty());

    let vector = engine
        .retrieve(
            "foo",
            fixture.repo_id,
            None,
            10,
            Strategy::Vector,
            &SearchFilters::default(),
        )
        .await;
    assert!(matches!(vector, Err(EngineError::Usage(_))));
}

#[tokio::test]
async fn missing_active_snapshot_returns_empty() {
    let (fixture, embedder) = embedded_fixture("no-snapshot").await;
    let engine = RetrievalEngine::new(fixture.db.clone(), fixture.fts.clone(), Some(embedder as std::sync::Arc<dyn Embedder>));

    // a repository that was never indexed
    let other_repo =
        lattice::db::repositories::ensure_repository(&fixture.db, "other-url", "main", "other")
            .await
            .unwrap();
    let results = engine
        .retrieve(
            "foo",
            other_repo,
            None,
            10,
            Strategy::Hybrid,
            &SearchFilters::default(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn filters_narrow_results_before_ranking() {
    let (fixture, embedder) = embedded_fixture("filters").await;
    let engine = RetrievalEngine::new(fixture.db.clone(), fixture.fts.clone(), Some(embedder as std::sync::Arc<dyn Embedder>));

    let filters = SearchFilters {
        exclude_language: vec!["python".to_owned()],
        ..Default::default()
    };
    let results = engine
        .retrieve(
            "foo",
            fixture.repo_id,
            None,
            10,
            Strategy::Hybrid,
            &filters,
        )
        .await
        .unwrap();
    assert!(results.is_empty());

    let filters = SearchFilters {
        path_prefix: vec!["b".to_owned()],
        ..Default::default()
    };
    let results = engine
        .retrieve(
            "foo",
            fixture.repo_id,
            None,
            10,
            Strategy::Keyword,
            &filters,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file_path, "b.py");
}

#[tokio::test]
async fn pinned_snapshot_keeps_reads_consistent() {
    let (mut fixture, embedder) = embedded_fixture("pinned").await;
    let first_snapshot = fixture.snapshot_id;

    common::write_files(
        &fixture.repo_dir,
        &[("a.py", "def renamed_everything():\n    return 0\n")],
    );
    common::commit_all(&fixture.repo_dir, "rewrite");
    let second_snapshot = fixture.reindex().await;
    assert_ne!(second_snapshot, first_snapshot);

    let engine = RetrievalEngine::new(fixture.db.clone(), fixture.fts.clone(), Some(embedder as std::sync::Arc<dyn Embedder>));

    // pinned to the old snapshot, the old definition is still there
    let results = engine
        .retrieve(
            "foo",
            fixture.repo_id,
            Some(first_snapshot),
            10,
            Strategy::Keyword,
            &SearchFilters::default(),
        )
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.file_path == "a.py"));

    // the active snapshot no longer matches on the old name
    let results = engine
        .retrieve(
            "marker",
            fixture.repo_id,
            None,
            10,
            Strategy::Keyword,
            &SearchFilters::default(),
        )
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.file_path != "a.py"));
}

#[tokio::test]
async fn reader_navigates_chunks_and_graph() {
    let (fixture, _) = embedded_fixture("reader").await;
    let reader = SnapshotReader::new(fixture.db.clone());

    let a_file = lattice::db::graph::file_by_path(&fixture.db, fixture.snapshot_id, "a.py")
        .await
        .unwrap()
        .unwrap();
    let a_chunks = lattice::db::graph::chunks_of_file(&fixture.db, a_file.id)
        .await
        .unwrap();
    assert_eq!(a_chunks.len(), 1);

    // impact: who calls into this chunk
    let impact = reader.analyze_impact(a_chunks[0].id, 10).await.unwrap();
    assert_eq!(impact.len(), 1);
    assert_eq!(impact[0].file_path, "b.py");

    let b_file = lattice::db::graph::file_by_path(&fixture.db, fixture.snapshot_id, "b.py")
        .await
        .unwrap()
        .unwrap();
    let b_chunks = lattice::db::graph::chunks_of_file(&fixture.db, b_file.id)
        .await
        .unwrap();

    let dependencies = reader.analyze_dependencies(b_chunks[0].id).await.unwrap();
    assert_eq!(dependencies.len(), 1);
    assert_eq!(dependencies[0].relation, "calls");

    // a single-chunk file has no neighbors
    let neighbor = reader
        .read_neighbor_chunk(a_chunks[0].id, NeighborDirection::Next)
        .await
        .unwrap();
    assert!(neighbor.is_none());

    // the call tree from b.py reaches a.py and stops at the depth cap
    let pipeline = reader
        .visualize_pipeline(b_chunks[0].id, 3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pipeline.children.len(), 1);
    assert_eq!(pipeline.children[0].file_path, "a.py");

    // line slicing through the reader
    let sliced = reader
        .read_file(fixture.snapshot_id, "a.py", Some(1), Some(1))
        .await
        .unwrap();
    assert_eq!(sliced, "def foo():\n");
}
