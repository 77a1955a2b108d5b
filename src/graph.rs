//! In-memory module graph used by the bundled dev server.
//!
//! Nodes are modules, edges point from an importer to the module it imports.
//! Two side tables map URLs and backing files to nodes, mirroring how a
//! bundler's dev server looks modules up on request and on file change.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use crate::host::{ModuleGraph, TransformResult};

/// A single module tracked by [`MemoryGraph`].
#[derive(Debug, Clone, Default)]
pub struct ModuleNode {
    /// URL this module is served under, if any.
    pub url: Option<String>,
    /// File backing this module, if known.
    pub file: Option<Utf8PathBuf>,
    /// Cached transform output, cleared on invalidation.
    pub transform: Option<TransformResult>,
}

#[derive(Debug, Default)]
pub struct MemoryGraph {
    graph: StableDiGraph<ModuleNode, ()>,
    urls: HashMap<String, NodeIndex>,
    files: HashMap<Utf8PathBuf, HashSet<NodeIndex>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeIndex) -> Option<&ModuleNode> {
        self.graph.node_weight(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

impl ModuleGraph for MemoryGraph {
    type Id = NodeIndex;

    fn module_by_url(&self, url: &str) -> Option<NodeIndex> {
        self.urls.get(url).copied()
    }

    fn ensure_entry_from_url(&mut self, url: &str) -> NodeIndex {
        if let Some(&id) = self.urls.get(url) {
            return id;
        }

        let id = self.graph.add_node(ModuleNode {
            url: Some(url.to_string()),
            ..Default::default()
        });
        self.urls.insert(url.to_string(), id);
        id
    }

    fn file_of(&self, id: NodeIndex) -> Option<&Utf8Path> {
        self.graph.node_weight(id)?.file.as_deref()
    }

    fn modules_by_file(&self, file: &Utf8Path) -> Vec<NodeIndex> {
        self.files
            .get(file)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn detach_file(&mut self, file: &Utf8Path) {
        self.files.remove(file);
    }

    fn attach_file(&mut self, id: NodeIndex, file: &Utf8Path) {
        if let Some(node) = self.graph.node_weight_mut(id) {
            node.file = Some(file.to_path_buf());
        }
        self.files.insert(file.to_path_buf(), HashSet::from([id]));
    }

    fn create_file_only_entry(&mut self, file: &Utf8Path) -> NodeIndex {
        let id = self.graph.add_node(ModuleNode {
            file: Some(file.to_path_buf()),
            ..Default::default()
        });
        self.files.entry(file.to_path_buf()).or_default().insert(id);
        id
    }

    fn link(&mut self, importer: NodeIndex, imported: NodeIndex) {
        self.graph.update_edge(importer, imported, ());
    }

    fn importers(&self, id: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(id, Direction::Incoming)
            .collect()
    }

    fn imported(&self, id: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(id, Direction::Outgoing)
            .collect()
    }

    fn invalidate(&mut self, id: NodeIndex) {
        if let Some(node) = self.graph.node_weight_mut(id) {
            node.transform = None;
        }
    }

    fn set_transform_result(&mut self, id: NodeIndex, result: TransformResult) {
        if let Some(node) = self.graph.node_weight_mut(id) {
            node.transform = Some(result);
        }
    }

    fn transform_result(&self, id: NodeIndex) -> Option<&TransformResult> {
        self.graph.node_weight(id)?.transform.as_ref()
    }
}

impl std::fmt::Display for MemoryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node
                .url
                .as_deref()
                .or(node.file.as_ref().map(|file| file.as_str()))
                .unwrap_or("?")
                .replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            if let Some((source, target)) = self.graph.edge_endpoints(edge) {
                writeln!(f, "    {} --> {}", source.index(), target.index())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_entry_is_idempotent() {
        let mut graph = MemoryGraph::new();
        let a = graph.ensure_entry_from_url("/a.html");
        let b = graph.ensure_entry_from_url("/a.html");
        assert_eq!(a, b);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.module_by_url("/a.html"), Some(a));
        assert_eq!(graph.file_of(a), None);
    }

    #[test]
    fn test_attach_replaces_file_association() {
        let mut graph = MemoryGraph::new();
        let page = graph.ensure_entry_from_url("/index.html");
        let other = graph.create_file_only_entry(Utf8Path::new("/site/index.njk"));

        graph.attach_file(page, Utf8Path::new("/site/index.njk"));
        assert_eq!(
            graph.modules_by_file(Utf8Path::new("/site/index.njk")),
            vec![page]
        );
        assert_eq!(graph.file_of(page), Some(Utf8Path::new("/site/index.njk")));
        assert_eq!(graph.file_of(other), Some(Utf8Path::new("/site/index.njk")));

        graph.detach_file(Utf8Path::new("/site/index.njk"));
        assert!(
            graph
                .modules_by_file(Utf8Path::new("/site/index.njk"))
                .is_empty()
        );
    }

    #[test]
    fn test_link_is_bidirectional_and_deduplicated() {
        let mut graph = MemoryGraph::new();
        let page = graph.ensure_entry_from_url("/index.html");
        let layout = graph.create_file_only_entry(Utf8Path::new("/site/base.njk"));

        graph.link(page, layout);
        graph.link(page, layout);

        assert_eq!(graph.importers(layout), vec![page]);
        assert_eq!(graph.imported(page), vec![layout]);
        assert!(graph.importers(page).is_empty());
    }

    #[test]
    fn test_invalidate_drops_transform() {
        let mut graph = MemoryGraph::new();
        let page = graph.ensure_entry_from_url("/index.html");
        let result = TransformResult {
            code: "<p></p>".into(),
            map: None,
        };

        graph.set_transform_result(page, result.clone());
        assert_eq!(graph.transform_result(page), Some(&result));

        graph.invalidate(page);
        assert_eq!(graph.transform_result(page), None);
    }

    #[test]
    fn test_display_mermaid() {
        let mut graph = MemoryGraph::new();
        let page = graph.ensure_entry_from_url("/index.html");
        let layout = graph.create_file_only_entry(Utf8Path::new("/site/base.njk"));
        graph.link(page, layout);

        let text = graph.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains(r#"["/index.html"]"#));
        assert!(text.contains(r#"["/site/base.njk"]"#));
        assert!(text.contains(&format!("{} --> {}", page.index(), layout.index())));
    }
}
