use crate::chunking::parse::sha256_hex;
use crate::db::staging::UnembeddedChunk;

/// Build the embedding prompt for one chunk. The template is stable on
/// purpose: the prompt's SHA-256 is the cache key across files and
/// snapshots, so any change here invalidates every cached vector.
/// `incoming_symbols` are the names arriving through the chunk's incoming
/// reference edges, already in deterministic order.
pub fn build_prompt(chunk: &UnembeddedChunk, incoming_symbols: &[String]) -> String {
    let tags: Vec<String> = chunk
        .metadata
        .get("tags")
        .and_then(|t| t.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();

    const ROLES: &[&str] = &[
        "entry_point",
        "test_suite",
        "test_case",
        "api_endpoint",
        "data_schema",
        "class",
        "function",
        "method",
    ];
    let (roles, other_tags): (Vec<&String>, Vec<&String>) =
        tags.iter().partition(|t| ROLES.contains(&t.as_str()));

    format!(
        "[CONTEXT]\n\
         File: {}\n\
         Language: {}\n\
         Category: {}\n\
         Role: {}\n\
         Tags: {}\n\
         Defines: {}\n\
         \n\
         [CODE]\n\
         {}",
        chunk.rel_path,
        chunk.language.as_deref().unwrap_or("unknown"),
        chunk.category,
        join(&roles),
        join(&other_tags),
        incoming_symbols.join(", "),
        chunk.text,
    )
}

pub fn vector_hash(prompt: &str) -> String {
    sha256_hex(prompt.as_bytes())
}

fn join(values: &[&String]) -> String {
    values
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, tags: serde_json::Value) -> UnembeddedChunk {
        UnembeddedChunk {
            chunk_id: 1,
            file_id: 1,
            snapshot_id: 1,
            rel_path: "src/app.py".to_owned(),
            language: Some("python".to_owned()),
            category: "source".to_owned(),
            metadata: serde_json::json!({ "tags": tags }),
            text: text.to_owned(),
        }
    }

    #[test]
    fn prompt_is_stable_for_identical_inputs() {
        let a = chunk("def foo(): pass", serde_json::json!(["function"]));
        let b = chunk("def foo(): pass", serde_json::json!(["function"]));
        assert_eq!(build_prompt(&a, &[]), build_prompt(&b, &[]));
        assert_eq!(
            vector_hash(&build_prompt(&a, &[])),
            vector_hash(&build_prompt(&b, &[]))
        );
    }

    #[test]
    fn prompt_carries_context_and_code_sections() {
        let prompt = build_prompt(
            &chunk("def foo(): pass", serde_json::json!(["function"])),
            &[],
        );
        assert!(prompt.starts_with("[CONTEXT]\n"));
        assert!(prompt.contains("File: src/app.py"));
        assert!(prompt.contains("Language: python"));
        assert!(prompt.contains("Role: function"));
        assert!(prompt.contains("[CODE]\ndef foo(): pass"));
    }

    #[test]
    fn defines_line_carries_incoming_symbol_names() {
        let incoming = vec!["handler".to_owned(), "dispatch".to_owned()];
        let prompt = build_prompt(
            &chunk("def foo(): pass", serde_json::json!(["function"])),
            &incoming,
        );
        assert!(prompt.contains("Defines: handler, dispatch\n"));
    }

    #[test]
    fn incoming_names_change_the_hash() {
        let source = chunk("def foo(): pass", serde_json::json!([]));
        let without = build_prompt(&source, &[]);
        let with = build_prompt(&source, &["caller".to_owned()]);
        assert_ne!(vector_hash(&without), vector_hash(&with));
    }

    #[test]
    fn different_text_changes_the_hash() {
        let a = build_prompt(&chunk("def foo(): pass", serde_json::json!([])), &[]);
        let b = build_prompt(&chunk("def bar(): pass", serde_json::json!([])), &[]);
        assert_ne!(vector_hash(&a), vector_hash(&b));
    }
}
