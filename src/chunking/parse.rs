use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::db::bulk::{NewChunk, NewContent, NewFile};
use crate::db::graph::RelationKind;
use crate::repo::types::FileDescriptor;

use super::languages::{chunk_tree, SourceChunk, TSLanguageConfig, TSLanguageParsing};
use super::text_document::NewlineIndex;

const BINARY_SNIFF_BYTES: usize = 8 * 1024;
const MAX_PARSE_BYTES: usize = 1024 * 1024;
const MINIFIED_MEAN_LINE_LEN: usize = 160;
const GENERATOR_MARKERS: &[&str] = &[
    "@generated",
    "DO NOT EDIT",
    "Code generated by",
    "automatically generated",
];

/// Everything one file contributes to a snapshot. Chunk `file_id`s are
/// placeholders until the write; edges reference chunks by index.
#[derive(Debug)]
pub struct ParsedFile {
    pub file: NewFile,
    pub contents: Vec<NewContent>,
    pub chunks: Vec<NewChunk>,
    pub edges: Vec<(usize, usize, RelationKind)>,
    pub fts: Vec<FtsDraft>,
}

/// A full-text document waiting for database identity; `chunk_index` is
/// None for the file-level document of skipped and failed files.
#[derive(Debug, Clone)]
pub struct FtsDraft {
    pub chunk_index: Option<usize>,
    pub roles: Vec<String>,
    pub tags: Vec<String>,
    pub content: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Language tag for the file row; parsing support is narrower than this.
pub fn language_for_extension(extension: &str) -> Option<&'static str> {
    Some(match extension {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" => "typescript",
        "tsx" => "typescript-react",
        "rs" => "rust",
        "java" => "java",
        "go" => "go",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "php" => "php",
        "rb" => "ruby",
        "kt" => "kotlin",
        "scala" => "scala",
        "vue" => "vue",
        "svelte" => "svelte",
        "css" | "scss" => "css",
        "html" => "html",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        "sql" => "sql",
        "md" => "markdown",
        "rst" => "restructuredtext",
        _ => return None,
    })
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .take(BINARY_SNIFF_BYTES)
        .any(|&b| b == 0 || (b < 0x08) || (0x0E..0x20).contains(&b) && b != 0x1B)
}

fn looks_generated(text: &str) -> bool {
    let head_end = text
        .char_indices()
        .nth(BINARY_SNIFF_BYTES)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..head_end];
    if GENERATOR_MARKERS.iter().any(|marker| head.contains(marker)) {
        return true;
    }
    let lines = text.lines().count().max(1);
    text.len() / lines > MINIFIED_MEAN_LINE_LEN
}

/// Turn one file into chunks, contents, and intra-file `child_of` edges.
/// Never fails: unparseable input degrades to a `skipped` or `failed`
/// file record that still carries the full text for readers.
pub fn parse_file(
    snapshot_id: i64,
    descriptor: &FileDescriptor,
    bytes: &[u8],
    registry: &TSLanguageParsing,
) -> ParsedFile {
    let text = String::from_utf8_lossy(bytes).into_owned();
    let file_hash = sha256_hex(text.as_bytes());
    let language = descriptor
        .extension
        .as_deref()
        .and_then(language_for_extension)
        .map(str::to_owned);

    let base_file = NewFile {
        snapshot_id,
        rel_path: descriptor.rel_path.clone(),
        language: language.clone(),
        size: text.len() as i64,
        category: descriptor.category.as_str().to_owned(),
        git_hash: descriptor.git_hash.clone(),
        parsing_status: "parsed".to_owned(),
        content_hash: Some(file_hash.clone()),
    };
    let file_content = NewContent {
        hash: file_hash,
        text: text.clone(),
        size: text.len() as i64,
    };

    let config = descriptor
        .extension
        .as_deref()
        .and_then(|ext| registry.for_extension(ext));

    let skip_reason = if looks_binary(bytes) {
        Some("binary")
    } else if bytes.len() > MAX_PARSE_BYTES {
        Some("too_large")
    } else if looks_generated(&text) {
        Some("generated")
    } else if config.is_none() {
        Some("unsupported_language")
    } else {
        None
    };

    if let Some(reason) = skip_reason {
        debug!(path = %descriptor.rel_path, reason, "skipping structural parse");
        return degraded(base_file, file_content, "skipped", language);
    }
    let config = config.unwrap();

    let mut parser = tree_sitter::Parser::new();
    if parser.set_language((config.grammar)()).is_err() {
        warn!(path = %descriptor.rel_path, "grammar failed to load");
        return degraded(base_file, file_content, "failed", language);
    }
    let Some(tree) = parser.parse(text.as_bytes(), None) else {
        warn!(path = %descriptor.rel_path, "parser returned no tree");
        return degraded(base_file, file_content, "failed", language);
    };
    if tree.root_node().has_error() {
        warn!(path = %descriptor.rel_path, "syntax errors, recording file without chunks");
        return degraded(base_file, file_content, "failed", language);
    }

    let source_chunks = chunk_tree(&tree, config, &text);
    if source_chunks.is_empty() {
        return degraded(base_file, file_content, "skipped", language);
    }

    let mut tags: Vec<Vec<String>> = vec![Vec::new(); source_chunks.len()];
    let mut identifiers: Vec<Vec<String>> = vec![Vec::new(); source_chunks.len()];
    apply_semantic_queries(config, &tree, &text, &source_chunks, &mut tags, &mut identifiers);
    if config.semantic_queries.is_empty() {
        for (i, chunk) in source_chunks.iter().enumerate() {
            if let Some(symbol) = &chunk.symbol {
                tags[i].push(symbol.clone());
            }
        }
    }

    let newlines = NewlineIndex::new(&text);
    let mut contents = vec![file_content];
    let mut seen_hashes: std::collections::HashSet<String> =
        contents.iter().map(|c| c.hash.clone()).collect();
    let mut chunks = Vec::with_capacity(source_chunks.len());
    let mut edges = Vec::new();
    let mut fts = Vec::with_capacity(source_chunks.len());

    for (index, chunk) in source_chunks.iter().enumerate() {
        let start = chunk.range.start.byte_offset;
        let end = chunk.range.end.byte_offset;
        let chunk_text = &text[start..end];
        let hash = sha256_hex(chunk_text.as_bytes());
        if seen_hashes.insert(hash.clone()) {
            contents.push(NewContent {
                hash: hash.clone(),
                text: chunk_text.to_owned(),
                size: chunk_text.len() as i64,
            });
        }

        let (start_line, end_line) = newlines.line_range(start, end);
        let metadata = chunk_metadata(chunk, &tags[index], &identifiers[index]);

        chunks.push(NewChunk {
            file_id: 0,
            content_hash: hash,
            start_byte: start as i64,
            end_byte: end as i64,
            start_line: start_line as i64,
            end_line: end_line as i64,
            metadata,
        });

        if let Some(parent) = chunk.parent {
            edges.push((index, parent, RelationKind::ChildOf));
        }

        let mut fts_tags = tags[index].clone();
        fts_tags.extend(identifiers[index].iter().cloned());
        fts.push(FtsDraft {
            chunk_index: Some(index),
            roles: tags[index].clone(),
            tags: fts_tags,
            content: chunk_text.to_owned(),
        });
    }

    ParsedFile {
        file: base_file,
        contents,
        chunks,
        edges,
        fts,
    }
}

fn degraded(
    file: NewFile,
    content: NewContent,
    status: &str,
    language: Option<String>,
) -> ParsedFile {
    let mut file = file;
    file.parsing_status = status.to_owned();
    let fts = vec![FtsDraft {
        chunk_index: None,
        roles: vec![file.category.clone()],
        tags: language.into_iter().collect(),
        content: String::new(),
    }];
    ParsedFile {
        file,
        contents: vec![content],
        chunks: Vec::new(),
        edges: Vec::new(),
        fts,
    }
}

fn chunk_metadata(
    chunk: &SourceChunk,
    tags: &[String],
    identifiers: &[String],
) -> serde_json::Value {
    let mut metadata = serde_json::Map::new();
    metadata.insert("tags".to_owned(), dedup_array(tags));
    if !identifiers.is_empty() {
        metadata.insert("identifiers".to_owned(), dedup_array(identifiers));
    }
    if let Some(symbol) = &chunk.symbol {
        metadata.insert("symbol".to_owned(), serde_json::Value::String(symbol.clone()));
    }
    if chunk.oversize {
        metadata.insert("oversize".to_owned(), serde_json::Value::Bool(true));
    }
    if chunk.container {
        metadata.insert("container".to_owned(), serde_json::Value::Bool(true));
    }
    serde_json::Value::Object(metadata)
}

fn dedup_array(values: &[String]) -> serde_json::Value {
    let mut seen = std::collections::HashSet::new();
    serde_json::Value::Array(
        values
            .iter()
            .filter(|v| seen.insert(v.as_str()))
            .map(|v| serde_json::Value::String(v.clone()))
            .collect(),
    )
}

/// Run the language's tag queries and attach each match to the smallest
/// chunk containing the captured node.
fn apply_semantic_queries(
    config: &TSLanguageConfig,
    tree: &tree_sitter::Tree,
    source: &str,
    chunks: &[SourceChunk],
    tags: &mut [Vec<String>],
    identifiers: &mut [Vec<String>],
) {
    for semantic in config.semantic_queries {
        let query = match tree_sitter::Query::new((config.grammar)(), semantic.query) {
            Ok(query) => query,
            Err(err) => {
                warn!(role = semantic.role, %err, "semantic query failed to compile");
                continue;
            }
        };
        let node_capture = query.capture_index_for_name("node");
        let name_capture = query.capture_index_for_name("name");

        let mut cursor = tree_sitter::QueryCursor::new();
        for query_match in cursor.matches(&query, tree.root_node(), source.as_bytes()) {
            let Some(node_index) = node_capture else {
                continue;
            };
            let Some(node) = query_match
                .captures
                .iter()
                .find(|c| c.index == node_index)
                .map(|c| c.node)
            else {
                continue;
            };

            let Some(chunk_index) =
                smallest_containing(chunks, node.start_byte(), node.end_byte())
            else {
                continue;
            };
            if !tags[chunk_index].contains(&semantic.role.to_owned()) {
                tags[chunk_index].push(semantic.role.to_owned());
            }

            if let Some(name_index) = name_capture {
                if let Some(name) = query_match
                    .captures
                    .iter()
                    .find(|c| c.index == name_index)
                    .map(|c| &source[c.node.start_byte()..c.node.end_byte()])
                {
                    if !identifiers[chunk_index].contains(&name.to_owned()) {
                        identifiers[chunk_index].push(name.to_owned());
                    }
                }
            }
        }
    }
}

fn smallest_containing(chunks: &[SourceChunk], start: usize, end: usize) -> Option<usize> {
    chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.range.contains_bytes(start, end))
        .min_by_key(|(_, c)| c.range.len())
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::types::{FileCategory, FileDescriptor};

    fn descriptor(rel_path: &str, extension: &str, category: FileCategory) -> FileDescriptor {
        FileDescriptor {
            rel_path: rel_path.to_owned(),
            full_path: rel_path.into(),
            extension: Some(extension.to_owned()),
            size: 1,
            git_hash: None,
            category,
        }
    }

    fn registry() -> TSLanguageParsing {
        TSLanguageParsing::init()
    }

    #[test]
    fn small_python_file_yields_one_tagged_chunk() {
        let source = b"def greet(name):\n    return f\"hi {name}\"\n";
        let parsed = parse_file(
            1,
            &descriptor("a.py", "py", FileCategory::Source),
            source,
            &registry(),
        );
        assert_eq!(parsed.file.parsing_status, "parsed");
        assert_eq!(parsed.chunks.len(), 1);
        let tags: Vec<String> = parsed.fts[0].roles.clone();
        assert!(tags.contains(&"function".to_owned()));
        assert!(parsed.fts[0].tags.contains(&"greet".to_owned()));
    }

    #[test]
    fn markdown_is_skipped_with_full_content_stored() {
        let source = b"# Title\n\nSome prose.\n";
        let parsed = parse_file(
            1,
            &descriptor("README.md", "md", FileCategory::Docs),
            source,
            &registry(),
        );
        assert_eq!(parsed.file.parsing_status, "skipped");
        assert!(parsed.chunks.is_empty());
        assert_eq!(parsed.contents.len(), 1);
        assert_eq!(parsed.contents[0].text, "# Title\n\nSome prose.\n");
        assert_eq!(parsed.fts.len(), 1);
        assert!(parsed.fts[0].chunk_index.is_none());
    }

    #[test]
    fn syntax_error_marks_file_failed_but_keeps_text() {
        let source = b"def broken(:\n    pass\n";
        let parsed = parse_file(
            1,
            &descriptor("bad.py", "py", FileCategory::Source),
            source,
            &registry(),
        );
        assert_eq!(parsed.file.parsing_status, "failed");
        assert!(parsed.chunks.is_empty());
        assert_eq!(parsed.contents.len(), 1);
    }

    #[test]
    fn binary_content_is_skipped() {
        let source = b"\x00\x01\x02binaryish";
        let parsed = parse_file(
            1,
            &descriptor("data.json", "json", FileCategory::Config),
            source,
            &registry(),
        );
        assert_eq!(parsed.file.parsing_status, "skipped");
    }

    #[test]
    fn generated_marker_skips_parsing() {
        let source = b"// Code generated by protoc. DO NOT EDIT.\nconst x = 1;\n";
        let parsed = parse_file(
            1,
            &descriptor("gen.js", "js", FileCategory::Source),
            source,
            &registry(),
        );
        assert_eq!(parsed.file.parsing_status, "skipped");
    }

    #[test]
    fn duplicate_chunk_text_emits_one_content_row() {
        let mut source = String::new();
        for _ in 0..2 {
            for i in 0..12 {
                source.push_str(&format!(
                    "def f{i}(x):\n    acc = [x + {i} for _ in range(10)]\n    return sum(acc)\n\n"
                ));
            }
        }
        let parsed = parse_file(
            1,
            &descriptor("dup.py", "py", FileCategory::Source),
            source.as_bytes(),
            &registry(),
        );
        assert_eq!(parsed.file.parsing_status, "parsed");
        assert!(parsed.chunks.len() > 1);
        let mut hashes: Vec<&str> = parsed.contents.iter().map(|c| c.hash.as_str()).collect();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), parsed.contents.len());
    }

    #[test]
    fn test_file_roles_are_detected() {
        let source = b"class TestParser:\n    def test_roundtrip(self):\n        assert True\n";
        let parsed = parse_file(
            1,
            &descriptor("tests/test_parser.py", "py", FileCategory::Test),
            source,
            &registry(),
        );
        let all_roles: Vec<String> = parsed
            .fts
            .iter()
            .flat_map(|draft| draft.roles.clone())
            .collect();
        assert!(all_roles.contains(&"test_suite".to_owned()));
        assert!(all_roles.contains(&"test_case".to_owned()));
    }
}
