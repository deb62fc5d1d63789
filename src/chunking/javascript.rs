use super::languages::{SemanticQuery, TSLanguageConfig};

pub fn javascript_language_config() -> TSLanguageConfig {
    TSLanguageConfig {
        language_ids: &["javascript", "javascript-react"],
        file_extensions: &["js", "jsx"],
        grammar: tree_sitter_javascript::language,
        scope_node_kinds: &[
            "class_declaration",
            "function_declaration",
            "method_definition",
            "generator_function_declaration",
        ],
        semantic_queries: JAVASCRIPT_QUERIES,
    }
}

pub(super) const JAVASCRIPT_QUERIES: &[SemanticQuery] = &[
    SemanticQuery {
        role: "class",
        query: "(class_declaration name: (identifier) @name) @node",
    },
    SemanticQuery {
        role: "function",
        query: "(function_declaration name: (identifier) @name) @node",
    },
    SemanticQuery {
        role: "function",
        query: "(lexical_declaration (variable_declarator name: (identifier) @name value: (arrow_function))) @node",
    },
    SemanticQuery {
        role: "method",
        query: "(method_definition name: (property_identifier) @name) @node",
    },
    SemanticQuery {
        role: "test_suite",
        query: "((call_expression function: (identifier) @fn) @node (#match? @fn \"^describe$\"))",
    },
    SemanticQuery {
        role: "test_case",
        query: "((call_expression function: (identifier) @fn) @node (#match? @fn \"^(it|test)$\"))",
    },
    SemanticQuery {
        role: "api_endpoint",
        query: "((call_expression function: (member_expression property: (property_identifier) @prop)) @node (#match? @prop \"^(get|post|put|delete|patch|use)$\"))",
    },
    SemanticQuery {
        role: "entry_point",
        query: "((call_expression function: (member_expression object: (identifier) @obj property: (property_identifier) @prop)) @node (#match? @obj \"^(app|server)$\") (#match? @prop \"^listen$\"))",
    },
];
