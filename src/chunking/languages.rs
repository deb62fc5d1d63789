use super::javascript::javascript_language_config;
use super::python::python_language_config;
use super::rust::rust_language_config;
use super::text_document::Range;
use super::typescript::{tsx_language_config, typescript_language_config};

/// Target chunk size in bytes.
pub const MAX_CHUNK_BYTES: usize = 800;
/// Atomic nodes up to `MAX_CHUNK_BYTES + CHUNK_TOLERANCE` stand alone.
pub const CHUNK_TOLERANCE: usize = 400;

/// A tree pattern mapped to a semantic role. The query must capture the
/// tagged node as `@node`; an optional `@name` capture contributes an
/// identifier.
#[derive(Debug, Clone)]
pub struct SemanticQuery {
    pub role: &'static str,
    pub query: &'static str,
}

#[derive(Clone)]
pub struct TSLanguageConfig {
    /// Language names this config covers, e.g. ["Typescript", "TSX"]
    pub language_ids: &'static [&'static str],

    /// Extensions that map a file to this config: rs, js, py, ...
    pub file_extensions: &'static [&'static str],

    /// tree-sitter grammar for this language
    pub grammar: fn() -> tree_sitter::Language,

    /// Node kinds that act as scopes: when one is too large to stand
    /// alone it is emitted as a container chunk and its pieces hang off
    /// it through `child_of` edges.
    pub scope_node_kinds: &'static [&'static str],

    /// Role-tagging queries; empty for languages with structural
    /// chunking only.
    pub semantic_queries: &'static [SemanticQuery],
}

impl TSLanguageConfig {
    pub fn language_id(&self) -> &'static str {
        self.language_ids[0]
    }
}

#[derive(Clone)]
pub struct TSLanguageParsing {
    configs: Vec<TSLanguageConfig>,
}

impl TSLanguageParsing {
    pub fn init() -> Self {
        Self {
            configs: vec![
                python_language_config(),
                javascript_language_config(),
                typescript_language_config(),
                tsx_language_config(),
                rust_language_config(),
            ],
        }
    }

    pub fn for_extension(&self, extension: &str) -> Option<&TSLanguageConfig> {
        self.configs
            .iter()
            .find(|config| config.file_extensions.contains(&extension))
    }

    pub fn for_lang(&self, language: &str) -> Option<&TSLanguageConfig> {
        self.configs
            .iter()
            .find(|config| config.language_ids.contains(&language))
    }
}

/// One structural chunk as emitted by the splitter, before any database
/// identity exists. `parent` indexes into the same output vector.
#[derive(Debug, Clone)]
pub struct SourceChunk {
    pub range: Range,
    pub parent: Option<usize>,
    pub oversize: bool,
    pub container: bool,
    /// Node kind for single-node chunks; None for coalesced sibling runs
    pub symbol: Option<String>,
}

/// Scope-aware recursive split. Nodes within the byte target are emitted whole;
/// oversized nodes recurse, coalescing runs of small siblings into one
/// chunk. An oversized node with no sub-structure is emitted atomically
/// and flagged. Oversized scope nodes become container chunks so the
/// containment shows up as explicit parent links.
pub fn chunk_tree(
    tree: &tree_sitter::Tree,
    config: &TSLanguageConfig,
    source: &str,
) -> Vec<SourceChunk> {
    let root = tree.root_node();
    let mut chunks = Vec::new();

    if root.end_byte() - root.start_byte() <= MAX_CHUNK_BYTES + CHUNK_TOLERANCE {
        if root.end_byte() > root.start_byte() {
            chunks.push(SourceChunk {
                range: Range::for_tree_node(&root),
                parent: None,
                oversize: false,
                container: false,
                symbol: Some(root.kind().to_owned()),
            });
        }
        return chunks;
    }

    chunk_node(root, config, source, None, &mut chunks);
    chunks
}

fn chunk_node(
    node: tree_sitter::Node,
    config: &TSLanguageConfig,
    source: &str,
    parent: Option<usize>,
    out: &mut Vec<SourceChunk>,
) {
    let mut walker = node.walk();
    let mut current: Option<Range> = None;

    let children: Vec<tree_sitter::Node> = node.children(&mut walker).collect();
    for child in children {
        let child_size = child.end_byte() - child.start_byte();

        if child_size > MAX_CHUNK_BYTES + CHUNK_TOLERANCE {
            flush(&mut current, parent, source, out);

            if child.named_child_count() == 0 {
                // no meaningful sub-structure; stands alone however big
                out.push(SourceChunk {
                    range: Range::for_tree_node(&child),
                    parent,
                    oversize: true,
                    container: false,
                    symbol: Some(child.kind().to_owned()),
                });
                continue;
            }

            let child_parent = if config.scope_node_kinds.contains(&child.kind()) {
                out.push(SourceChunk {
                    range: Range::for_tree_node(&child),
                    parent,
                    oversize: true,
                    container: true,
                    symbol: Some(child.kind().to_owned()),
                });
                Some(out.len() - 1)
            } else {
                parent
            };
            chunk_node(child, config, source, child_parent, out);
        } else {
            let child_range = Range::for_tree_node(&child);
            match &mut current {
                None => current = Some(child_range),
                Some(range) => {
                    let combined = child_range.end.byte_offset - range.start.byte_offset;
                    if combined > MAX_CHUNK_BYTES {
                        flush(&mut current, parent, source, out);
                        current = Some(child_range);
                    } else {
                        range.end = child_range.end;
                    }
                }
            }
        }
    }

    flush(&mut current, parent, source, out);
}

fn flush(
    current: &mut Option<Range>,
    parent: Option<usize>,
    source: &str,
    out: &mut Vec<SourceChunk>,
) {
    if let Some(range) = current.take() {
        let text = &source[range.start.byte_offset..range.end.byte_offset];
        if !text.trim().is_empty() {
            out.push(SourceChunk {
                range,
                parent,
                oversize: range.len() > MAX_CHUNK_BYTES + CHUNK_TOLERANCE,
                container: false,
                symbol: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(config: &TSLanguageConfig, source: &str) -> tree_sitter::Tree {
        let mut parser = tree_sitter::Parser::new();
        parser.set_language((config.grammar)()).unwrap();
        parser.parse(source, None).unwrap()
    }

    #[test]
    fn small_file_is_one_chunk() {
        let config = python_language_config();
        let source = "def foo():\n    return 1\n";
        let tree = parse(&config, source);
        let chunks = chunk_tree(&tree, &config, source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range.start.byte_offset, 0);
        assert_eq!(chunks[0].range.end.byte_offset, source.len());
        assert!(!chunks[0].oversize);
    }

    #[test]
    fn large_file_splits_on_top_level_nodes() {
        let config = python_language_config();
        let mut source = String::new();
        for i in 0..12 {
            source.push_str(&format!(
                "def handler_{i}(payload):\n    value = payload.get('k{i}')\n    \
                 result = [x * {i} for x in range(100)]\n    return value, result\n\n\n"
            ));
        }
        assert!(source.len() > MAX_CHUNK_BYTES + CHUNK_TOLERANCE);
        let tree = parse(&config, &source);
        let chunks = chunk_tree(&tree, &config, &source);
        assert!(chunks.len() > 1);

        // source order and no overlap between sibling chunks
        for pair in chunks.windows(2) {
            assert!(pair[0].range.start.byte_offset <= pair[1].range.start.byte_offset);
        }
        for (i, a) in chunks.iter().enumerate() {
            for b in chunks.iter().skip(i + 1) {
                let disjoint = a.range.end.byte_offset <= b.range.start.byte_offset
                    || b.range.end.byte_offset <= a.range.start.byte_offset;
                let contains = a.range.contains_bytes(
                    b.range.start.byte_offset,
                    b.range.end.byte_offset,
                ) || b.range.contains_bytes(
                    a.range.start.byte_offset,
                    a.range.end.byte_offset,
                );
                assert!(disjoint || contains);
            }
        }
    }

    #[test]
    fn oversized_scope_node_becomes_container_with_children() {
        let config = python_language_config();
        let mut source = String::from("class Mega:\n");
        for i in 0..16 {
            source.push_str(&format!(
                "    def method_{i}(self, arg):\n        data = [arg + {i} for _ in range(50)]\n        \
                 return sum(data) + {i}\n\n"
            ));
        }
        assert!(source.len() > MAX_CHUNK_BYTES + CHUNK_TOLERANCE);
        let tree = parse(&config, &source);
        let chunks = chunk_tree(&tree, &config, &source);

        let container = chunks
            .iter()
            .position(|c| c.container)
            .expect("class should become a container");
        assert_eq!(chunks[container].symbol.as_deref(), Some("class_definition"));
        let children: Vec<_> = chunks
            .iter()
            .filter(|c| c.parent == Some(container))
            .collect();
        assert!(!children.is_empty());
        for child in children {
            assert!(chunks[container].range.contains_bytes(
                child.range.start.byte_offset,
                child.range.end.byte_offset
            ));
        }
    }

    #[test]
    fn giant_leaf_node_is_emitted_atomically_and_flagged() {
        let config = python_language_config();
        let filler = "x".repeat(MAX_CHUNK_BYTES + CHUNK_TOLERANCE + 100);
        let source = format!("data = \"{filler}\"\n\ndef after():\n    return 2\n");
        let tree = parse(&config, &source);
        let chunks = chunk_tree(&tree, &config, &source);
        assert!(chunks.iter().any(|c| c.oversize));
    }
}
