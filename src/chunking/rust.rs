use super::languages::TSLanguageConfig;

// No semantic query set yet; rust files get structural chunking only.
pub fn rust_language_config() -> TSLanguageConfig {
    TSLanguageConfig {
        language_ids: &["rust"],
        file_extensions: &["rs"],
        grammar: tree_sitter_rust::language,
        scope_node_kinds: &[
            "impl_item",
            "mod_item",
            "function_item",
            "struct_item",
            "enum_item",
            "trait_item",
        ],
        semantic_queries: &[],
    }
}
