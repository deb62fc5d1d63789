use once_cell::sync::Lazy;
use regex::Regex;
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, FAST, INDEXED, STORED,
    STRING,
};
use tantivy::tokenizer::{Token, TokenStream, Tokenizer};

pub const CODE_TOKENIZER: &str = "code";

/// One document per chunk; skipped and failed files get a file-level
/// document with `chunk_id = 0` so path queries still surface them.
#[derive(Clone)]
pub struct ChunkSchema {
    pub schema: Schema,

    /// 0 marks a file-level document
    pub chunk_id: Field,
    pub snapshot_id: Field,
    pub file_id: Field,

    /// Raw path for prefix filtering and retrieval
    pub rel_path: Field,
    /// Tokenized path so identifier queries can hit file names
    pub path_text: Field,

    /// Raw terms for pre-ranking filters
    pub language: Field,
    pub category: Field,
    pub roles: Field,

    /// Semantic tags and identifiers; boosted above content at query time
    pub tags: Field,
    pub content: Field,
}

impl ChunkSchema {
    pub fn new() -> Self {
        let mut builder = tantivy::schema::SchemaBuilder::new();
        let code_text = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(CODE_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );

        let chunk_id = builder.add_u64_field("chunk_id", INDEXED | STORED | FAST);
        let snapshot_id = builder.add_u64_field("snapshot_id", INDEXED | STORED | FAST);
        let file_id = builder.add_u64_field("file_id", INDEXED | STORED | FAST);

        let rel_path = builder.add_text_field("rel_path", STRING | STORED);
        let path_text = builder.add_text_field("path_text", code_text.clone());

        let language = builder.add_text_field("language", STRING);
        let category = builder.add_text_field("category", STRING);
        let roles = builder.add_text_field("roles", STRING);

        let tags = builder.add_text_field("tags", code_text.clone());
        let content = builder.add_text_field("content", code_text);

        Self {
            schema: builder.build(),
            chunk_id,
            snapshot_id,
            file_id,
            rel_path,
            path_text,
            language,
            category,
            roles,
            tags,
            content,
        }
    }
}

impl Default for ChunkSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Code-friendly tokenizer: case-folds, splits on non-identifier characters,
/// emits whole identifiers verbatim plus their snake_case and camelCase
/// parts. No stemming, no stop words.
#[derive(Clone, Default)]
pub struct CodeTokenizer;

pub struct CodeTokenStream {
    tokens: Vec<Token>,
    /// index of the token one past the current one
    position: usize,
}

impl Tokenizer for CodeTokenizer {
    type TokenStream<'a> = CodeTokenStream;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        CodeTokenStream {
            tokens: code_tokens(text),
            position: 0,
        }
    }
}

impl TokenStream for CodeTokenStream {
    fn advance(&mut self) -> bool {
        if self.position >= self.tokens.len() {
            return false;
        }
        self.position += 1;
        true
    }

    fn token(&self) -> &Token {
        &self.tokens[self.position - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.position - 1]
    }
}

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").unwrap());
static CAMEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z]+[a-z0-9]*|[a-z0-9]+").unwrap());

fn push_token(tokens: &mut Vec<Token>, text: String, offset_from: usize, offset_to: usize) {
    if text.is_empty() {
        return;
    }
    let position = tokens.len();
    tokens.push(Token {
        offset_from,
        offset_to,
        position,
        text,
        position_length: 1,
    });
}

/// Tokenize `text` for indexing and querying. Identifiers are preserved as a
/// single lowercased token; sub-tokens are added for snake_case and
/// camelCase compounds.
pub fn code_tokens(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for word in WORD_RE.find_iter(text) {
        let raw = word.as_str();
        push_token(&mut tokens, raw.to_lowercase(), word.start(), word.end());

        let compound = raw.contains('_') || raw.chars().any(|c| c.is_uppercase());
        if !compound {
            continue;
        }
        for part in raw.split('_') {
            for sub in CAMEL_RE.find_iter(part) {
                let sub_text = sub.as_str().to_lowercase();
                if sub_text != raw.to_lowercase() {
                    push_token(&mut tokens, sub_text, word.start(), word.end());
                }
            }
        }
    }
    tokens
}

/// The token bag for a text, deduplicated; used when building query clauses.
pub fn query_tokens(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    code_tokens(text)
        .into_iter()
        .filter_map(|t| seen.insert(t.text.clone()).then_some(t.text))
        .collect()
}
