//! Development serving.
//!
//! [`ServeAdapter::handle`] runs on every request that reaches the dev server.
//! It decides whether a page is owed, renders the matching template and
//! splices the template's includes into the host's module graph, so that the
//! host knows a layout edit has to invalidate every page built from it. The
//! rendered markup is then handed back to the host's transform pipeline,
//! which injects client scripts before the response goes out.
//!
//! The request path goes through these steps:
//!
//! 1. Internal host paths and ignored URLs pass through.
//! 2. The URL is mapped to a path under the server root, with the default
//!    document appended to directory URLs.
//! 3. Anything without the markup extension passes through.
//! 4. Files that exist on disk pass through, they are never shadowed.
//! 5. The template next to the requested path is looked up, a missing
//!    template is a 404.
//! 6. The page's graph node is fetched or created and pointed at the
//!    template.
//! 7. Every template the page includes gets a node linked to the page.
//! 8. The template is rendered.
//! 9. The markup becomes the node's cached transform result.
//! 10. The host transforms the result and the page is sent.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::Instrument;
use url::Url;

use crate::error::ServeError;
use crate::host::{DevServer, ModuleGraph, ReloadEvent, Response, TransformResult};
use crate::ignore::IgnoreMatcher;
use crate::include::{self, IncludeGraph, ScanIncludeGraph};
use crate::render::{RenderOptions, render};
use crate::utils::{has_extension, normalize_path, to_template};
use crate::{DEFAULT_DOCUMENT, MARKUP_EXT, TEMPLATE_EXT};

/// Prefixes of URLs the host serves itself.
const INTERNAL_PREFIXES: &[&str] = &["/@", "/__inspect/"];

static BASE_URL: LazyLock<Url> =
    LazyLock::new(|| Url::parse("relative:///").expect("Error parsing base URL"));

/// What the host should do with a request after the adapter has seen it.
#[derive(Debug)]
pub enum Outcome {
    /// Not a page request, continue with the host's own handling.
    Next,
    /// Send this response as is.
    Respond(Response),
    /// Report this error through the host's error path.
    Fail(ServeError),
}

/// Serve-time half of the plugin.
pub struct ServeAdapter {
    options: RenderOptions,
    ignore: IgnoreMatcher,
    reload: bool,
    include: Option<Arc<dyn IncludeGraph>>,
}

impl std::fmt::Debug for ServeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeAdapter")
            .field("options", &self.options)
            .field("ignore", &self.ignore)
            .field("reload", &self.reload)
            .field("include", &self.include.as_ref().map(|_| "*"))
            .finish()
    }
}

impl ServeAdapter {
    pub fn new(options: RenderOptions, ignore: IgnoreMatcher, reload: bool) -> Self {
        Self {
            options,
            ignore,
            reload,
            include: None,
        }
    }

    /// Replaces the default include graph, which scans template sources
    /// under the search paths on every request.
    pub fn include_graph(mut self, graph: impl IncludeGraph + 'static) -> Self {
        self.include = Some(Arc::new(graph));
        self
    }

    /// Intercepts a request for `raw_url`, the request target as received.
    pub async fn handle<S: DevServer>(&self, server: &S, raw_url: &str) -> Outcome {
        let span = tracing::debug_span!("request", url = raw_url);

        match self.try_handle(server, raw_url).instrument(span).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(url = raw_url, "{err}");
                Outcome::Fail(err)
            }
        }
    }

    async fn try_handle<S: DevServer>(
        &self,
        server: &S,
        raw_url: &str,
    ) -> Result<Outcome, ServeError> {
        if raw_url.is_empty() || INTERNAL_PREFIXES.iter().any(|p| raw_url.starts_with(p)) {
            return Ok(Outcome::Next);
        }

        let Ok(url) = BASE_URL.join(raw_url) else {
            return Ok(Outcome::Next);
        };
        let url = url.path().to_string();

        if self.ignore.matches(&url) {
            tracing::debug!("ignored");
            return Ok(Outcome::Next);
        }

        let root = server.root();
        let page = page_path(root, &url);

        if !has_extension(&page, MARKUP_EXT) {
            return Ok(Outcome::Next);
        }

        if exists(&page).await {
            tracing::debug!(%page, "serving existing file");
            return Ok(Outcome::Next);
        }

        let template = Utf8PathBuf::from(to_template(page.as_str()));
        if !exists(&template).await {
            tracing::debug!(%template, "no template");
            return Ok(Outcome::Respond(Response::html(404, "404 Not Found")));
        }

        let dir = page.parent().unwrap_or(root).to_path_buf();
        let ancestors = self.ancestors(root, dir, template.clone()).await?;

        let id = server.with_graph(|graph| {
            let id = match graph.module_by_url(&url) {
                Some(id) => id,
                None => graph.ensure_entry_from_url(&url),
            };

            if graph.file_of(id) != Some(template.as_path()) {
                if let Some(old) = graph.file_of(id).map(Utf8Path::to_path_buf) {
                    graph.detach_file(&old);
                }
                graph.attach_file(id, &template);
            }

            for ancestor in &ancestors {
                let imported = match graph.modules_by_file(ancestor).first() {
                    Some(&imported) => imported,
                    None => graph.create_file_only_entry(ancestor),
                };
                graph.link(id, imported);
            }

            id
        });

        let markup = render(root, &template, &self.options).await?;
        tracing::info!(%template, "rendered");

        server.with_graph(|graph| {
            graph.set_transform_result(
                id,
                TransformResult {
                    code: markup,
                    map: None,
                },
            )
        });

        let result = server
            .transform_request(&url)
            .await
            .map_err(|err| ServeError::Host(url.clone(), err))?
            .ok_or(ServeError::UnexpectedState)?;

        let html = server
            .transform_index_html(&url, result.code)
            .await
            .map_err(|err| ServeError::Host(url.clone(), err))?;

        Ok(Outcome::Respond(Response::html(200, html)))
    }

    async fn ancestors(
        &self,
        root: &Utf8Path,
        dir: Utf8PathBuf,
        template: Utf8PathBuf,
    ) -> Result<HashSet<Utf8PathBuf>, ServeError> {
        let graph: Arc<dyn IncludeGraph> = match &self.include {
            Some(graph) => graph.clone(),
            None => Arc::new(ScanIncludeGraph::new(
                self.options.resolve_search_paths(root),
            )),
        };

        let ancestors = tokio::task::spawn_blocking(move || {
            include::ancestors(graph.as_ref(), &dir, &template)
        })
        .await??;

        Ok(ancestors)
    }

    /// Reacts to a change of `file`: every template importing it is
    /// invalidated, and clients are told to reload unless reloading is
    /// disabled.
    ///
    /// Always returns no modules, the host must not run its own update
    /// resolution on top of this.
    pub fn handle_hot_update<S: DevServer>(
        &self,
        server: &S,
        file: &Utf8Path,
    ) -> Vec<<S::Graph as ModuleGraph>::Id> {
        server.with_graph(|graph| {
            for module in graph.modules_by_file(file) {
                for importer in graph.importers(module) {
                    if graph
                        .file_of(importer)
                        .is_some_and(|path| has_extension(path, TEMPLATE_EXT))
                    {
                        tracing::debug!(?importer, "invalidated");
                        graph.invalidate(importer);
                    }
                }
            }
        });

        if self.reload {
            tracing::info!(%file, "changed, reloading");
            server.broadcast(ReloadEvent::FullReload);
        }

        Vec::new()
    }

    /// Directories whose files can affect a page served from `root`.
    #[cfg(feature = "live")]
    pub(crate) fn watched_paths(&self, root: &Utf8Path) -> HashSet<Utf8PathBuf> {
        let mut paths: HashSet<_> = self.options.resolve_search_paths(root).into_iter().collect();
        paths.insert(root.to_path_buf());
        paths
    }
}

/// File-system equivalent of a URL path under `root`.
fn page_path(root: &Utf8Path, url: &str) -> Utf8PathBuf {
    let mut path = root.join(url.trim_start_matches('/'));

    if url.ends_with('/') {
        path.push(DEFAULT_DOCUMENT);
    }

    normalize_path(&path)
}

async fn exists(path: &Utf8Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
