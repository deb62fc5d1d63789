use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters reported on snapshot activation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct SnapshotStats {
    pub files_total: usize,
    pub files_parsed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub cache_hits: usize,
    pub chunks: usize,
    pub contents: usize,
    pub intra_file_edges: usize,
    pub cross_file_edges: usize,
    pub relations_file_fallback: usize,
    pub relations_dropped: usize,
}

/// Nested directory tree stored with the snapshot so directory listings
/// never touch the file table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ManifestNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ManifestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ManifestNode>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    Dir,
    File,
}

#[derive(Default)]
struct TreeBuilder {
    dirs: BTreeMap<String, TreeBuilder>,
    files: Vec<String>,
}

impl TreeBuilder {
    fn insert(&mut self, components: &[&str]) {
        match components {
            [] => {}
            [file] => self.files.push((*file).to_owned()),
            [dir, rest @ ..] => self
                .dirs
                .entry((*dir).to_owned())
                .or_default()
                .insert(rest),
        }
    }

    fn build(self, name: String) -> ManifestNode {
        let mut children: Vec<ManifestNode> = self
            .dirs
            .into_iter()
            .map(|(dir_name, builder)| builder.build(dir_name))
            .collect();
        let mut files = self.files;
        files.sort();
        children.extend(files.into_iter().map(|file| ManifestNode {
            name: file,
            kind: ManifestKind::File,
            children: None,
        }));
        ManifestNode {
            name,
            kind: ManifestKind::Dir,
            children: Some(children),
        }
    }
}

/// Build the manifest from repo-relative POSIX paths. Directories come
/// first, alphabetically, then files.
pub fn build_manifest(paths: &[String]) -> ManifestNode {
    let mut builder = TreeBuilder::default();
    for path in paths {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        builder.insert(&components);
    }
    builder.build(String::new())
}
