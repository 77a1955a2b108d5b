//! Extension points consumed from the host tool.
//!
//! The adapters never own host state. They reach the dev server and its
//! module graph only through the traits in this module, and query them fresh
//! on every request.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use camino::Utf8Path;

use crate::error::HostError;

/// Cached output of the host's transform pipeline for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
}

/// Event pushed to connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEvent {
    FullReload,
}

/// The host's module dependency graph.
///
/// A module represents one servable URL or one plain file. Edges go from an
/// importer to the module it imports; [`ModuleGraph::importers`] walks them
/// backwards.
pub trait ModuleGraph {
    type Id: Copy + Eq + Hash + Debug + Send;

    fn module_by_url(&self, url: &str) -> Option<Self::Id>;

    /// Returns the module registered for `url`, creating it without a file
    /// if there is none.
    fn ensure_entry_from_url(&mut self, url: &str) -> Self::Id;

    fn file_of(&self, id: Self::Id) -> Option<&Utf8Path>;

    fn modules_by_file(&self, file: &Utf8Path) -> Vec<Self::Id>;

    /// Forgets which modules are backed by `file`. The modules themselves
    /// stay in the graph.
    fn detach_file(&mut self, file: &Utf8Path);

    /// Makes `file` the backing file of `id`, and `id` the only module
    /// registered for `file`.
    fn attach_file(&mut self, id: Self::Id, file: &Utf8Path);

    /// Creates a module that has a file but no URL.
    fn create_file_only_entry(&mut self, file: &Utf8Path) -> Self::Id;

    /// Records that `importer` depends on `imported`, in both directions.
    fn link(&mut self, importer: Self::Id, imported: Self::Id);

    fn importers(&self, id: Self::Id) -> Vec<Self::Id>;

    fn imported(&self, id: Self::Id) -> Vec<Self::Id>;

    /// Drops cached transform output, forcing a fresh transform.
    fn invalidate(&mut self, id: Self::Id);

    fn set_transform_result(&mut self, id: Self::Id, result: TransformResult);

    fn transform_result(&self, id: Self::Id) -> Option<&TransformResult>;
}

/// The running development server.
pub trait DevServer: Send + Sync {
    type Graph: ModuleGraph;

    /// Absolute directory requests are served from.
    fn root(&self) -> &Utf8Path;

    /// Runs `f` with exclusive access to the module graph.
    fn with_graph<R>(&self, f: impl FnOnce(&mut Self::Graph) -> R) -> R;

    /// Runs the host's own transform pipeline for `url`.
    fn transform_request(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<TransformResult>, HostError>> + Send;

    /// Final host-level post-processing of a markup response.
    fn transform_index_html(
        &self,
        url: &str,
        html: String,
    ) -> impl Future<Output = Result<String, HostError>> + Send;

    fn broadcast(&self, event: ReloadEvent);
}

/// Terminal response produced by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8",
            body: body.into(),
        }
    }
}
