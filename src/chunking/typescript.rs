use super::languages::{SemanticQuery, TSLanguageConfig};

pub fn typescript_language_config() -> TSLanguageConfig {
    TSLanguageConfig {
        language_ids: &["typescript"],
        file_extensions: &["ts"],
        grammar: tree_sitter_typescript::language_typescript,
        scope_node_kinds: TS_SCOPE_KINDS,
        semantic_queries: TYPESCRIPT_QUERIES,
    }
}

pub fn tsx_language_config() -> TSLanguageConfig {
    TSLanguageConfig {
        language_ids: &["typescript-react"],
        file_extensions: &["tsx"],
        grammar: tree_sitter_typescript::language_tsx,
        scope_node_kinds: TS_SCOPE_KINDS,
        semantic_queries: TYPESCRIPT_QUERIES,
    }
}

const TS_SCOPE_KINDS: &[&str] = &[
    "class_declaration",
    "function_declaration",
    "method_definition",
    "interface_declaration",
    "module",
];

const TYPESCRIPT_QUERIES: &[SemanticQuery] = &[
    SemanticQuery {
        role: "class",
        query: "(class_declaration name: (type_identifier) @name) @node",
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
        role: "data_schema",
        query: "(interface_declaration name: (type_identifier) @name) @node",
    },
    SemanticQuery {
        role: "data_schema",
        query: "(type_alias_declaration name: (type_identifier) @name) @node",
    },
    SemanticQuery {
        role: "data_schema",
        query: "(enum_declaration name: (identifier) @name) @node",
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
];
