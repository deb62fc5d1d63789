#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use lattice::application::background::Pipes;
use lattice::application::config::configuration::Configuration;
use lattice::chunking::languages::TSLanguageParsing;
use lattice::db::repositories::ensure_repository;
use lattice::db::{sqlite, EngineResult, SqlDb};
use lattice::embedder::Embedder;
use lattice::fts::FtsIndex;
use lattice::indexer::orchestrator::{IndexOutcome, IndexerOrchestrator};
use lattice::relations::{JsonlRelationFeed, RelationSource};
use lattice::repo::sync::RepoManager;
use lattice::repo::types::RepoRef;

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A scratch directory unique to this process and call site.
pub fn fresh_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "lattice-test-{}-{}-{}",
        label,
        std::process::id(),
        DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git to spawn");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A working repository with the given files committed on `main`.
pub fn init_git_repo(label: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = fresh_dir(label);
    run_git(&dir, &["init"]);
    run_git(&dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    run_git(&dir, &["config", "user.email", "tests@example.com"]);
    run_git(&dir, &["config", "user.name", "tests"]);
    write_files(&dir, files);
    run_git(&dir, &["add", "-A"]);
    run_git(&dir, &["commit", "-m", "init"]);
    dir
}

pub fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (rel_path, contents) in files {
        let path = dir.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(path, contents).expect("write file");
    }
}

pub fn commit_all(dir: &Path, message: &str) {
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-m", message]);
}

pub async fn memory_db() -> SqlDb {
    sqlite::init_sqlite_db("sqlite::memory:", 1)
        .await
        .expect("in-memory database")
}

pub fn test_config(volume: &Path) -> Configuration {
    Configuration {
        db_url: "sqlite::memory:".to_owned(),
        repo_volume: volume.to_owned(),
        index_dir: None,
        embedding_api_key: None,
        embedding_api_base: "http://localhost:0".to_owned(),
        embedding_model: "fake-model".to_owned(),
        embedding_dimension: 8,
        max_workers: 2,
        files_per_task: 50,
        max_concurrency: 2,
        embed_batch_size: 1,
        max_file_size: 1024 * 1024,
    }
}

/// A fully indexed fixture repository backed by in-memory storage.
pub struct TestEngine {
    pub db: SqlDb,
    pub fts: Arc<FtsIndex>,
    pub orchestrator: IndexerOrchestrator,
    pub repo: RepoRef,
    pub repo_dir: PathBuf,
    pub repo_id: i64,
    pub snapshot_id: i64,
}

impl TestEngine {
    /// Re-index the repository after new commits; returns the new
    /// snapshot id and updates the fixture's pointer.
    pub async fn reindex(&mut self) -> i64 {
        let outcome = self
            .orchestrator
            .index(&self.repo, "fixture", false, &Pipes::new(0))
            .await
            .expect("reindex");
        match outcome {
            IndexOutcome::Indexed { snapshot_id, .. }
            | IndexOutcome::Reused { snapshot_id } => {
                self.snapshot_id = snapshot_id;
                snapshot_id
            }
            IndexOutcome::Queued => panic!("unexpected queued outcome"),
        }
    }
}

/// Index `files` from a fresh git repository; `feed_rows` optionally
/// seeds a JSON-lines cross-file relation feed.
pub async fn index_fixture(
    label: &str,
    files: &[(&str, &str)],
    feed_rows: &[serde_json::Value],
) -> TestEngine {
    let repo_dir = init_git_repo(label, files);
    let volume = fresh_dir(&format!("{label}-volume"));

    let mut sources: Vec<Arc<dyn RelationSource>> = Vec::new();
    if !feed_rows.is_empty() {
        let feed_path = fresh_dir(&format!("{label}-feed")).join("relations.jsonl");
        let lines: Vec<String> = feed_rows.iter().map(|row| row.to_string()).collect();
        std::fs::write(&feed_path, lines.join("\n")).expect("write feed");
        sources.push(Arc::new(JsonlRelationFeed::new(feed_path)));
    }

    let db = memory_db().await;
    let fts = Arc::new(FtsIndex::in_memory().expect("fts"));
    let orchestrator = IndexerOrchestrator::new(
        Arc::new(test_config(&volume)),
        db.clone(),
        fts.clone(),
        Arc::new(TSLanguageParsing::init()),
        Arc::new(RepoManager::new(volume.clone())),
        sources,
    );
    let repo = RepoRef::new(repo_dir.to_string_lossy(), "main");

    let outcome = orchestrator
        .index(&repo, "fixture", false, &Pipes::new(0))
        .await
        .expect("index fixture");
    let IndexOutcome::Indexed { snapshot_id, .. } = outcome else {
        panic!("fixture should index fresh");
    };
    let repo_id = ensure_repository(&db, &repo.url, "main", "fixture")
        .await
        .expect("repo id");

    TestEngine {
        db,
        fts,
        orchestrator,
        repo,
        repo_dir,
        repo_id,
        snapshot_id,
    }
}

/// Deterministic in-process provider: the vector is a function of the
/// text alone, and every provider call is counted.
pub struct FakeEmbedder {
    calls: AtomicUsize,
    model: String,
}

impl FakeEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            model: "fake-model".to_owned(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % 8] += byte as f32 / 255.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn batch_embed(&self, texts: Vec<&str>) -> EngineResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|text| Self::vector_for(text)).collect())
    }

    fn dimension(&self) -> usize {
        8
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
