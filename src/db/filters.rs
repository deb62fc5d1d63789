use serde::{Deserialize, Serialize};

/// Optional narrowing applied to vector and keyword search, always before
/// ranking. Values within one key are OR-ed; negative keys AND across.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    #[serde(default)]
    pub language: Vec<String>,
    #[serde(default)]
    pub exclude_language: Vec<String>,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub exclude_category: Vec<String>,
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default)]
    pub exclude_role: Vec<String>,
    #[serde(default)]
    pub path_prefix: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self == &SearchFilters::default()
    }

    /// Compile to SQL predicates over aliases `f` (files) and `c` (chunks),
    /// returning the clause fragment and its bind values in order. Roles are
    /// matched against the JSON metadata tag array on the chunk.
    pub fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        let mut in_list = |column: &str, values: &[String], negated: bool| {
            if values.is_empty() {
                return;
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            let not = if negated { "NOT " } else { "" };
            clauses.push(format!("{}{} IN ({})", not, column, placeholders));
            binds.extend(values.iter().cloned());
        };

        in_list("f.language", &self.language, false);
        in_list("f.language", &self.exclude_language, true);
        in_list("f.category", &self.category, false);
        in_list("f.category", &self.exclude_category, true);

        if !self.role.is_empty() {
            let placeholders = vec!["?"; self.role.len()].join(", ");
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(c.metadata, '$.tags') \
                 WHERE json_each.value IN ({}))",
                placeholders
            ));
            binds.extend(self.role.iter().cloned());
        }
        if !self.exclude_role.is_empty() {
            let placeholders = vec!["?"; self.exclude_role.len()].join(", ");
            clauses.push(format!(
                "NOT EXISTS (SELECT 1 FROM json_each(c.metadata, '$.tags') \
                 WHERE json_each.value IN ({}))",
                placeholders
            ));
            binds.extend(self.exclude_role.iter().cloned());
        }

        if !self.path_prefix.is_empty() {
            let ors = self
                .path_prefix
                .iter()
                .map(|_| "f.rel_path LIKE ? || '%'")
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({})", ors));
            binds.extend(self.path_prefix.iter().cloned());
        }

        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" AND {}", clauses.join(" AND ")), binds)
        }
    }
}
