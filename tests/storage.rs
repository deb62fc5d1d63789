mod common;

use lattice::db::bulk::{add_contents, add_files, write_parsed_file, NewChunk, NewContent, NewFile, ParsedFileWrite};
use lattice::db::graph::{
    self, ingest_cross_file_relations, CrossFileRelation, RelationKind,
};
use lattice::db::repositories::{active_snapshot_of, ensure_repository};
use lattice::db::snapshots::{
    activate_snapshot, create_snapshot, fail_snapshot, garbage_collect_contents, snapshot_status,
    SnapshotStatus,
};
use lattice::db::EngineError;

fn empty_json() -> serde_json::Value {
    serde_json::json!({})
}

fn file_row(snapshot_id: i64, rel_path: &str) -> NewFile {
    NewFile {
        snapshot_id,
        rel_path: rel_path.to_owned(),
        language: Some("python".to_owned()),
        size: 10,
        category: "source".to_owned(),
        git_hash: None,
        parsing_status: "parsed".to_owned(),
        content_hash: None,
    }
}

fn chunk_row(content_hash: &str, start: i64, end: i64) -> NewChunk {
    NewChunk {
        file_id: 0,
        content_hash: content_hash.to_owned(),
        start_byte: start,
        end_byte: end,
        start_line: 1,
        end_line: 1,
        metadata: serde_json::json!({ "tags": [] }),
    }
}

fn content_row(hash: &str, text: &str) -> NewContent {
    NewContent {
        hash: hash.to_owned(),
        text: text.to_owned(),
        size: text.len() as i64,
    }
}

#[tokio::test]
async fn ensure_repository_is_idempotent() {
    let db = common::memory_db().await;
    let a = ensure_repository(&db, "https://example.com/r.git", "main", "r")
        .await
        .unwrap();
    let b = ensure_repository(&db, "https://example.com/r.git", "main", "r")
        .await
        .unwrap();
    assert_eq!(a, b);

    let other_branch = ensure_repository(&db, "https://example.com/r.git", "dev", "r")
        .await
        .unwrap();
    assert_ne!(a, other_branch);
}

#[tokio::test]
async fn snapshot_lifecycle_and_advisory_lock() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();

    let (first, created) = create_snapshot(&db, repo, "commit-a", false).await.unwrap();
    let first = first.unwrap();
    assert!(created);

    // a second attempt on the same repository yields while one is indexing
    let (second, created) = create_snapshot(&db, repo, "commit-b", false).await.unwrap();
    assert!(second.is_none());
    assert!(!created);

    // readers never see the in-progress snapshot
    assert_eq!(active_snapshot_of(&db, repo).await.unwrap(), None);

    activate_snapshot(&db, repo, first, &empty_json(), &empty_json())
        .await
        .unwrap();
    assert_eq!(active_snapshot_of(&db, repo).await.unwrap(), Some(first));
    assert_eq!(
        snapshot_status(&db, first).await.unwrap(),
        SnapshotStatus::Completed
    );

    // indexing the same commit again reuses the completed snapshot
    let (reused, created) = create_snapshot(&db, repo, "commit-a", false).await.unwrap();
    assert_eq!(reused, Some(first));
    assert!(!created);

    // force_new bypasses the reuse path
    let (forced, created) = create_snapshot(&db, repo, "commit-a", true).await.unwrap();
    assert!(created);
    assert_ne!(forced, Some(first));
}

#[tokio::test]
async fn forced_reindex_supersedes_the_old_snapshot() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();

    let (first, _) = create_snapshot(&db, repo, "commit-x", false).await.unwrap();
    let first = first.unwrap();
    activate_snapshot(&db, repo, first, &empty_json(), &empty_json())
        .await
        .unwrap();

    let (second, created) = create_snapshot(&db, repo, "commit-x", true).await.unwrap();
    let second = second.unwrap();
    assert!(created);
    let pruned = activate_snapshot(&db, repo, second, &empty_json(), &empty_json())
        .await
        .unwrap();

    assert_eq!(pruned, vec![first]);
    assert_eq!(active_snapshot_of(&db, repo).await.unwrap(), Some(second));
    assert!(matches!(
        snapshot_status(&db, first).await,
        Err(EngineError::Usage(_))
    ));
}

#[tokio::test]
async fn illegal_transitions_are_state_errors() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();
    let (snapshot, _) = create_snapshot(&db, repo, "c", false).await.unwrap();
    let snapshot = snapshot.unwrap();

    activate_snapshot(&db, repo, snapshot, &empty_json(), &empty_json())
        .await
        .unwrap();

    // completed -> completed and completed -> failed are both illegal
    let again = activate_snapshot(&db, repo, snapshot, &empty_json(), &empty_json()).await;
    assert!(matches!(again, Err(EngineError::State(_))));
    let failed = fail_snapshot(&db, snapshot, "boom").await;
    assert!(matches!(failed, Err(EngineError::State(_))));
}

#[tokio::test]
async fn failed_snapshot_never_touches_the_active_pointer() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();

    let (first, _) = create_snapshot(&db, repo, "a", false).await.unwrap();
    let first = first.unwrap();
    activate_snapshot(&db, repo, first, &empty_json(), &empty_json())
        .await
        .unwrap();

    let (second, _) = create_snapshot(&db, repo, "b", false).await.unwrap();
    let second = second.unwrap();
    fail_snapshot(&db, second, "worker exploded").await.unwrap();

    assert_eq!(active_snapshot_of(&db, repo).await.unwrap(), Some(first));
    assert_eq!(
        snapshot_status(&db, second).await.unwrap(),
        SnapshotStatus::Failed
    );
}

#[tokio::test]
async fn bulk_inserts_have_set_semantics() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();
    let (snapshot, _) = create_snapshot(&db, repo, "c", false).await.unwrap();
    let snapshot = snapshot.unwrap();

    add_contents(&db, &[content_row("h1", "text one")])
        .await
        .unwrap();
    // second insert of the same hash is a no-op
    add_contents(&db, &[content_row("h1", "text one")])
        .await
        .unwrap();

    let ids_a = add_files(&db, &[file_row(snapshot, "a.py")]).await.unwrap();
    let ids_b = add_files(&db, &[file_row(snapshot, "a.py")]).await.unwrap();
    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn cross_file_relations_resolve_exact_containing_and_fallback() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();
    let (snapshot, _) = create_snapshot(&db, repo, "c", false).await.unwrap();
    let snapshot = snapshot.unwrap();

    add_contents(
        &db,
        &[content_row("ha", "def foo(): pass"), content_row("hb", "foo()")],
    )
    .await
    .unwrap();

    let (_, chunks_a) = write_parsed_file(
        &db,
        ParsedFileWrite {
            file: file_row(snapshot, "a.py"),
            contents: vec![],
            chunks: vec![chunk_row("ha", 0, 100)],
            edges: vec![],
        },
    )
    .await
    .unwrap();
    let (_, chunks_b) = write_parsed_file(
        &db,
        ParsedFileWrite {
            file: file_row(snapshot, "b.py"),
            contents: vec![],
            chunks: vec![chunk_row("hb", 0, 50), chunk_row("hb", 10, 30)],
            edges: vec![],
        },
    )
    .await
    .unwrap();

    let rows = vec![
        // exact match on a.py's chunk
        CrossFileRelation {
            source_path: "b.py".into(),
            source_start: 12,
            source_end: 20,
            target_path: "a.py".into(),
            target_start: 0,
            target_end: 100,
            relation: RelationKind::Calls,
        },
        // duplicate triple collapses
        CrossFileRelation {
            source_path: "b.py".into(),
            source_start: 12,
            source_end: 20,
            target_path: "a.py".into(),
            target_start: 0,
            target_end: 100,
            relation: RelationKind::Calls,
        },
        // outside any chunk in a.py: attaches to the file pseudo-node
        CrossFileRelation {
            source_path: "b.py".into(),
            source_start: 0,
            source_end: 5,
            target_path: "a.py".into(),
            target_start: 200,
            target_end: 220,
            relation: RelationKind::References,
        },
        // unknown path: dropped
        CrossFileRelation {
            source_path: "missing.py".into(),
            source_start: 0,
            source_end: 5,
            target_path: "a.py".into(),
            target_start: 0,
            target_end: 100,
            relation: RelationKind::Imports,
        },
    ];

    let report = ingest_cross_file_relations(&db, snapshot, &rows)
        .await
        .unwrap();
    assert_eq!(report.resolved, 2);
    assert_eq!(report.file_fallback, 1);
    assert_eq!(report.dropped, 1);

    // the byte range 12..20 resolves to the smallest containing chunk
    let incoming = graph::incoming_refs(&db, chunks_a[0], 10).await.unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].chunk.id, chunks_b[1]);
    assert_eq!(incoming[0].kind, RelationKind::Calls);
}

#[tokio::test]
async fn child_of_edges_drive_parent_and_children() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();
    let (snapshot, _) = create_snapshot(&db, repo, "c", false).await.unwrap();
    let snapshot = snapshot.unwrap();

    add_contents(&db, &[content_row("h", "class C: ...")])
        .await
        .unwrap();
    let (_, chunk_ids) = write_parsed_file(
        &db,
        ParsedFileWrite {
            file: file_row(snapshot, "c.py"),
            contents: vec![],
            chunks: vec![
                chunk_row("h", 0, 100),
                chunk_row("h", 10, 40),
                chunk_row("h", 50, 90),
            ],
            edges: vec![
                (1, 0, RelationKind::ChildOf),
                (2, 0, RelationKind::ChildOf),
            ],
        },
    )
    .await
    .unwrap();

    let parent = graph::parent(&db, chunk_ids[1]).await.unwrap().unwrap();
    assert_eq!(parent.id, chunk_ids[0]);

    let children = graph::children(&db, chunk_ids[0]).await.unwrap();
    assert_eq!(children.len(), 2);

    let next = graph::neighbor(&db, chunk_ids[1], true).await.unwrap().unwrap();
    assert_eq!(next.id, chunk_ids[2]);
    let prev = graph::neighbor(&db, chunk_ids[1], false).await.unwrap().unwrap();
    assert_eq!(prev.id, chunk_ids[0]);
}

#[tokio::test]
async fn content_rows_survive_until_unreferenced() {
    let db = common::memory_db().await;
    let repo = ensure_repository(&db, "url", "main", "r").await.unwrap();
    let (snapshot, _) = create_snapshot(&db, repo, "c", false).await.unwrap();
    let snapshot = snapshot.unwrap();

    add_contents(
        &db,
        &[content_row("used", "x"), content_row("orphan", "y")],
    )
    .await
    .unwrap();
    write_parsed_file(
        &db,
        ParsedFileWrite {
            file: file_row(snapshot, "a.py"),
            contents: vec![],
            chunks: vec![chunk_row("used", 0, 10)],
            edges: vec![],
        },
    )
    .await
    .unwrap();

    let removed = garbage_collect_contents(&db).await.unwrap();
    assert_eq!(removed, 1);
    assert!(graph::content_text(&db, "used").await.unwrap().is_some());
    assert!(graph::content_text(&db, "orphan").await.unwrap().is_none());
}
