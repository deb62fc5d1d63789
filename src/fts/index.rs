use std::path::Path;

use anyhow::Context;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, RegexQuery, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Document, Index, IndexReader, IndexWriter, Term};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::db::filters::SearchFilters;
use crate::db::{EngineError, EngineResult};

use super::schema::{query_tokens, ChunkSchema, CodeTokenizer, CODE_TOKENIZER};

const WRITER_BUFFER_BYTES: usize = 50_000_000;
const TAG_BOOST: f32 = 2.0;

/// One full-text document. `chunk_id = None` indexes the file-level
/// document used for skipped and failed files.
#[derive(Debug, Clone)]
pub struct FtsDoc {
    pub chunk_id: Option<i64>,
    pub snapshot_id: i64,
    pub file_id: i64,
    pub rel_path: String,
    pub language: Option<String>,
    pub category: String,
    pub roles: Vec<String>,
    pub tags: Vec<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct FtsHit {
    /// None for file-level documents
    pub chunk_id: Option<i64>,
    pub file_id: i64,
    pub rel_path: String,
    pub score: f32,
}

/// A wrapper around the tantivy index: schema, a single shared writer, and
/// a reloadable reader.
pub struct FtsIndex {
    pub source: ChunkSchema,
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: RwLock<IndexReader>,
}

impl FtsIndex {
    /// Open or create the on-disk index at `path`.
    pub fn open(path: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(path).context("failed to create index dir")?;
        let source = ChunkSchema::new();
        let index = Index::open_or_create(
            tantivy::directory::MmapDirectory::open(path).context("failed to open index dir")?,
            source.schema.clone(),
        )
        .context("failed to open index")?;
        Self::wrap(source, index)
    }

    /// RAM-backed index for tests.
    pub fn in_memory() -> EngineResult<Self> {
        let source = ChunkSchema::new();
        let index = Index::create_in_ram(source.schema.clone());
        Self::wrap(source, index)
    }

    fn wrap(source: ChunkSchema, index: Index) -> EngineResult<Self> {
        index
            .tokenizers()
            .register(CODE_TOKENIZER, CodeTokenizer);
        let writer = index
            .writer(WRITER_BUFFER_BYTES)
            .context("failed to create index writer")?;
        let reader = index.reader().context("failed to create index reader")?;
        Ok(Self {
            source,
            index,
            writer: Mutex::new(writer),
            reader: RwLock::new(reader),
        })
    }

    async fn refresh_reader(&self) -> EngineResult<()> {
        *self.reader.write().await = self.index.reader().context("reader refresh failed")?;
        Ok(())
    }

    fn doc_for(&self, doc: &FtsDoc) -> Document {
        let mut document = Document::default();
        document.add_u64(self.source.chunk_id, doc.chunk_id.unwrap_or(0) as u64);
        document.add_u64(self.source.snapshot_id, doc.snapshot_id as u64);
        document.add_u64(self.source.file_id, doc.file_id as u64);
        document.add_text(self.source.rel_path, &doc.rel_path);
        document.add_text(self.source.path_text, &doc.rel_path);
        if let Some(language) = &doc.language {
            document.add_text(self.source.language, language);
        }
        document.add_text(self.source.category, &doc.category);
        for role in &doc.roles {
            document.add_text(self.source.roles, role);
        }
        document.add_text(self.source.tags, doc.tags.join(" "));
        document.add_text(self.source.content, &doc.content);
        document
    }

    /// Bulk-add documents and make them visible; the `add_fts` operation.
    pub async fn add_documents(&self, docs: &[FtsDoc]) -> EngineResult<()> {
        {
            let mut writer = self.writer.lock().await;
            for doc in docs {
                writer
                    .add_document(self.doc_for(doc))
                    .context("failed to queue document")?;
            }
            writer.commit().context("index commit failed")?;
        }
        self.refresh_reader().await?;
        debug!(count = docs.len(), "fts documents committed");
        Ok(())
    }

    /// Drop every document of a snapshot.
    pub async fn delete_snapshot(&self, snapshot_id: i64) -> EngineResult<()> {
        {
            let mut writer = self.writer.lock().await;
            writer.delete_term(Term::from_field_u64(
                self.source.snapshot_id,
                snapshot_id as u64,
            ));
            writer.commit().context("index commit failed")?;
        }
        self.refresh_reader().await
    }

    fn filter_clauses(
        &self,
        filters: &SearchFilters,
    ) -> EngineResult<Vec<(Occur, Box<dyn Query>)>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        let term_union = |field, values: &[String]| -> Box<dyn Query> {
            let terms = values
                .iter()
                .map(|v| {
                    Box::new(TermQuery::new(
                        Term::from_field_text(field, v),
                        IndexRecordOption::Basic,
                    )) as Box<dyn Query>
                })
                .collect::<Vec<_>>();
            Box::new(BooleanQuery::union(terms))
        };

        if !filters.language.is_empty() {
            clauses.push((Occur::Must, term_union(self.source.language, &filters.language)));
        }
        for language in &filters.exclude_language {
            clauses.push((
                Occur::MustNot,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.source.language, language),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if !filters.category.is_empty() {
            clauses.push((Occur::Must, term_union(self.source.category, &filters.category)));
        }
        for category in &filters.exclude_category {
            clauses.push((
                Occur::MustNot,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.source.category, category),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if !filters.role.is_empty() {
            clauses.push((Occur::Must, term_union(self.source.roles, &filters.role)));
        }
        for role in &filters.exclude_role {
            clauses.push((
                Occur::MustNot,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.source.roles, role),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if !filters.path_prefix.is_empty() {
            let prefixes = filters
                .path_prefix
                .iter()
                .map(|prefix| {
                    RegexQuery::from_pattern(
                        &format!("{}.*", regex::escape(prefix)),
                        self.source.rel_path,
                    )
                    .map(|q| Box::new(q) as Box<dyn Query>)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| EngineError::Usage(format!("bad path prefix: {err}")))?;
            clauses.push((Occur::Must, Box::new(BooleanQuery::union(prefixes))));
        }

        Ok(clauses)
    }

    /// Keyword search scoped to one snapshot, filters applied before
    /// ranking; tag matches outweigh content matches.
    pub async fn search(
        &self,
        query_string: &str,
        limit: usize,
        snapshot_id: i64,
        filters: &SearchFilters,
    ) -> EngineResult<Vec<FtsHit>> {
        let tokens = query_tokens(query_string);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut token_clauses: Vec<Box<dyn Query>> = Vec::new();
        for token in &tokens {
            for (field, boost) in [
                (self.source.content, 1.0f32),
                (self.source.path_text, 1.0),
                (self.source.tags, TAG_BOOST),
            ] {
                let term = TermQuery::new(
                    Term::from_field_text(field, token),
                    IndexRecordOption::WithFreqs,
                );
                token_clauses.push(Box::new(BoostQuery::new(Box::new(term), boost)));
            }
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_u64(self.source.snapshot_id, snapshot_id as u64),
                    IndexRecordOption::Basic,
                )),
            ),
            (Occur::Must, Box::new(BooleanQuery::union(token_clauses))),
        ];
        clauses.extend(self.filter_clauses(filters)?);
        let query = BooleanQuery::new(clauses);

        let reader = self.reader.read().await;
        let searcher = reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit.max(1)))
            .context("search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc = searcher.doc(address).context("doc fetch failed")?;
            let get_u64 = |field| doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0);
            let chunk_id = get_u64(self.source.chunk_id) as i64;
            hits.push(FtsHit {
                chunk_id: (chunk_id != 0).then_some(chunk_id),
                file_id: get_u64(self.source.file_id) as i64,
                rel_path: doc
                    .get_first(self.source.rel_path)
                    .and_then(|v| v.as_text())
                    .unwrap_or_default()
                    .to_owned(),
                score,
            });
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(chunk_id: i64, snapshot_id: i64, path: &str, content: &str, tags: &[&str]) -> FtsDoc {
        FtsDoc {
            chunk_id: (chunk_id != 0).then_some(chunk_id),
            snapshot_id,
            file_id: chunk_id.max(1),
            rel_path: path.to_owned(),
            language: Some("python".to_owned()),
            category: "source".to_owned(),
            roles: vec!["function".to_owned()],
            tags: tags.iter().map(|t| t.to_string()).collect(),
            content: content.to_owned(),
        }
    }

    #[tokio::test]
    async fn search_is_snapshot_scoped() {
        let index = FtsIndex::in_memory().unwrap();
        index
            .add_documents(&[
                doc(1, 10, "a.py", "def foo(): pass", &[]),
                doc(2, 11, "a.py", "def foo(): pass", &[]),
            ])
            .await
            .unwrap();

        let hits = index
            .search("foo", 10, 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, Some(1));
    }

    #[tokio::test]
    async fn tag_matches_outrank_content_matches() {
        let index = FtsIndex::in_memory().unwrap();
        index
            .add_documents(&[
                doc(1, 10, "a.py", "nothing relevant here", &["parser"]),
                doc(2, 10, "b.py", "parser parser mentioned once", &[]),
            ])
            .await
            .unwrap();

        let hits = index
            .search("parser", 10, 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, Some(1));
    }

    #[tokio::test]
    async fn filters_narrow_before_ranking() {
        let index = FtsIndex::in_memory().unwrap();
        let mut markdown = doc(3, 10, "README.md", "foo documented", &[]);
        markdown.language = Some("markdown".to_owned());
        markdown.category = "docs".to_owned();
        index
            .add_documents(&[doc(1, 10, "a.py", "def foo(): pass", &[]), markdown])
            .await
            .unwrap();

        let filters = SearchFilters {
            exclude_category: vec!["docs".to_owned()],
            ..Default::default()
        };
        let hits = index.search("foo", 10, 10, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rel_path, "a.py");
    }

    #[tokio::test]
    async fn file_level_documents_are_found_by_path() {
        let index = FtsIndex::in_memory().unwrap();
        index
            .add_documents(&[doc(0, 10, "notes/design_notes.md", "", &[])])
            .await
            .unwrap();

        let hits = index
            .search("design_notes", 10, 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, None);
    }

    #[tokio::test]
    async fn delete_snapshot_removes_documents() {
        let index = FtsIndex::in_memory().unwrap();
        index
            .add_documents(&[doc(1, 10, "a.py", "def foo(): pass", &[])])
            .await
            .unwrap();
        index.delete_snapshot(10).await.unwrap();
        let hits = index
            .search("foo", 10, 10, &SearchFilters::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
