use super::languages::{SemanticQuery, TSLanguageConfig};

pub fn python_language_config() -> TSLanguageConfig {
    TSLanguageConfig {
        language_ids: &["python"],
        file_extensions: &["py"],
        grammar: tree_sitter_python::language,
        scope_node_kinds: &["class_definition", "function_definition", "decorated_definition"],
        semantic_queries: PYTHON_QUERIES,
    }
}

// Order matters: later roles refine earlier ones, so `function` comes
// before `method` and the test roles.
const PYTHON_QUERIES: &[SemanticQuery] = &[
    SemanticQuery {
        role: "class",
        query: "(class_definition name: (identifier) @name) @node",
    },
    SemanticQuery {
        role: "function",
        query: "(function_definition name: (identifier) @name) @node",
    },
    SemanticQuery {
        role: "method",
        query: "(class_definition body: (block (function_definition name: (identifier) @name) @node))",
    },
    SemanticQuery {
        role: "method",
        query: "(class_definition body: (block (decorated_definition definition: (function_definition name: (identifier) @name)) @node))",
    },
    SemanticQuery {
        role: "test_suite",
        query: "((class_definition name: (identifier) @name) @node (#match? @name \"^Test\"))",
    },
    SemanticQuery {
        role: "test_case",
        query: "((function_definition name: (identifier) @name) @node (#match? @name \"^test_\"))",
    },
    SemanticQuery {
        role: "entry_point",
        query: "((if_statement condition: (comparison_operator) @cond) @node (#match? @cond \"__name__\"))",
    },
    SemanticQuery {
        role: "api_endpoint",
        query: "((decorated_definition (decorator) @dec definition: (function_definition name: (identifier) @name)) @node (#match? @dec \"route|get|post|put|delete|patch|websocket\"))",
    },
    SemanticQuery {
        role: "data_schema",
        query: "((class_definition name: (identifier) @name superclasses: (argument_list) @bases) @node (#match? @bases \"BaseModel|TypedDict|NamedTuple|Schema|Enum\"))",
    },
    SemanticQuery {
        role: "data_schema",
        query: "((decorated_definition (decorator) @dec definition: (class_definition name: (identifier) @name)) @node (#match? @dec \"dataclass\"))",
    },
];
