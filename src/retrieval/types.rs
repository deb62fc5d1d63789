use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Vector,
    Keyword,
    Hybrid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParentContext {
    pub chunk_id: i64,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub semantic_labels: Vec<String>,
    /// First line of the enclosing block, e.g. the class header
    pub heading: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OutgoingDefinition {
    pub name: String,
    pub relation: String,
    pub chunk_id: i64,
    pub file_path: String,
    pub start_line: i64,
}

/// One ranked retrieval result with its one-hop graph context.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetrievedContext {
    /// `chunk:<id>` or `file:<id>` for file-level hits
    pub node_id: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content: String,
    pub score: f32,
    pub retrieval_method: RetrievalMethod,
    pub semantic_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<ParentContext>,
    pub outgoing_definitions: Vec<OutgoingDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_chunk_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_chunk_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chunk_id: Option<i64>,
}

impl RetrievedContext {
    /// Markdown payload for LLM consumption.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[CONTEXT]\n");
        out.push_str(&format!(
            "File: {} (lines {}-{})\n",
            self.file_path, self.start_line, self.end_line
        ));
        if !self.semantic_labels.is_empty() {
            out.push_str(&format!("Labels: {}\n", self.semantic_labels.join(", ")));
        }
        if let Some(parent) = &self.parent_context {
            out.push_str(&format!(
                "Enclosing: {} (lines {}-{})\n",
                parent.heading.trim(),
                parent.start_line,
                parent.end_line
            ));
        }
        out.push_str(&format!("Score: {:.4}\n", self.score));

        out.push_str("\n[CODE]\n```\n");
        out.push_str(&self.content);
        if !self.content.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n");

        if !self.outgoing_definitions.is_empty() {
            out.push_str("\n[RELATIONS]\n");
            for definition in &self.outgoing_definitions {
                out.push_str(&format!(
                    "- {} {} ({}:{})\n",
                    definition.relation,
                    definition.name,
                    definition.file_path,
                    definition.start_line
                ));
            }
        }
        out
    }
}
