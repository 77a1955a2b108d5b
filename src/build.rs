//! One-shot bundling.
//!
//! [`BuildAdapter`] hooks into id resolution and content loading: a reference
//! to `page.njk` is rewritten to `page.html`, and loading `page.html` renders
//! the template it came from. [`bundle`] is a minimal host pass driving those
//! hooks for a list of entries and writing the results to disk.

use std::collections::HashMap;
use std::fs;
use std::sync::{LazyLock, Mutex};
use std::time::Instant;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::BuildError;
use crate::render::{RenderOptions, render};
use crate::utils::{absolute, has_extension, normalize_path, relative_to, to_markup};
use crate::{MARKUP_EXT, TEMPLATE_EXT};

const ANSI_BLUE: Style = Style::new().blue();

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("#>-")
});

/// Build-time half of the plugin.
#[derive(Debug)]
pub struct BuildAdapter {
    root: Utf8PathBuf,
    options: RenderOptions,
    /// Rewritten markup id mapped back to the template it was resolved from.
    ids: Mutex<HashMap<String, Utf8PathBuf>>,
}

impl BuildAdapter {
    pub fn new(options: RenderOptions) -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            options,
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Fixes the project root once the host has resolved its configuration.
    pub fn config_resolved(&mut self, root: impl AsRef<Utf8Path>) -> Result<(), BuildError> {
        self.root = normalize_path(&absolute(root.as_ref())?);
        Ok(())
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Rewrites a template reference to its markup id. Anything else is left
    /// to the host's own resolution.
    pub fn resolve_id(&self, source: &str) -> Option<String> {
        if !source.ends_with(&format!(".{TEMPLATE_EXT}")) {
            return None;
        }

        let id = to_markup(source);
        self.ids
            .lock()
            .unwrap()
            .insert(id.clone(), Utf8PathBuf::from(source));

        tracing::debug!(%source, %id, "resolved template");
        Some(id)
    }

    /// Loads markup for an id produced by [`resolve_id`](Self::resolve_id).
    /// Other markup ids are read from disk as is, everything else is
    /// declined.
    pub async fn load(&self, id: &str) -> Result<Option<String>, BuildError> {
        if !has_extension(id, MARKUP_EXT) {
            return Ok(None);
        }

        let template = self.ids.lock().unwrap().get(id).cloned();

        match template {
            Some(template) => {
                let template = if template.is_absolute() {
                    template
                } else {
                    normalize_path(&self.root.join(template))
                };

                let markup = render(&self.root, &template, &self.options).await?;
                Ok(Some(markup))
            }
            None => {
                let path = Utf8Path::new(id);
                let path = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    normalize_path(&self.root.join(path))
                };

                Ok(Some(tokio::fs::read_to_string(path).await?))
            }
        }
    }
}

/// A rendered page, ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Path relative to the output directory.
    pub path: Utf8PathBuf,
    pub text: String,
}

/// Runs a bundling pass over `entries`.
///
/// Relative entries are resolved against the adapter's root. Each entry is
/// resolved, loaded and written to `dist` under its path relative to the
/// root. The first failure aborts the pass.
pub async fn bundle<S>(
    adapter: &BuildAdapter,
    entries: &[S],
    dist: impl AsRef<Utf8Path>,
) -> Result<Vec<Page>, BuildError>
where
    S: AsRef<str>,
{
    let s = Instant::now();
    let dist = dist.as_ref();

    let bar = ProgressBar::new(entries.len() as u64);
    bar.set_style(PROGRESS_STYLE.clone());

    let mut pages = Vec::with_capacity(entries.len());

    for entry in entries {
        let entry = entry.as_ref();
        bar.set_message(entry.to_string());

        let source = if Utf8Path::new(entry).is_absolute() {
            entry.to_string()
        } else {
            normalize_path(&adapter.root.join(entry)).into_string()
        };

        let id = adapter.resolve_id(&source).unwrap_or(source);
        let text = match adapter.load(&id).await? {
            Some(text) => text,
            None if Utf8Path::new(&id).is_file() => fs::read_to_string(&id)?,
            None => return Err(BuildError::NotTemplate(entry.to_string())),
        };

        let path = relative_to(&adapter.root, Utf8Path::new(&id));
        if path.components().next() == Some(Utf8Component::ParentDir) {
            return Err(BuildError::OutsideRoot(entry.to_string(), id.into()));
        }

        pages.push(Page { path, text });
        bar.inc(1);
    }

    save_pages(&pages, dist)?;

    bar.finish_with_message(format!(
        "Bundled {} pages {}",
        pages.len(),
        ANSI_BLUE.apply_to(format!("(+{}ms)", s.elapsed().as_millis()))
    ));

    tracing::info!(pages = pages.len(), %dist, "bundle complete");
    Ok(pages)
}

fn save_pages(pages: &[Page], dist: &Utf8Path) -> std::io::Result<()> {
    fs::create_dir_all(dist)?;

    for page in pages {
        let file_path = dist.join(&page.path);

        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        fs::write(&file_path, &page.text)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minijinja::context;

    fn site(files: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        for (path, text) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }

        (dir, root)
    }

    fn adapter(root: &Utf8Path, options: RenderOptions) -> BuildAdapter {
        let mut adapter = BuildAdapter::new(options);
        adapter.config_resolved(root).unwrap();
        adapter
    }

    #[test]
    fn test_resolve_id() {
        let adapter = BuildAdapter::new(RenderOptions::default());

        assert_eq!(
            adapter.resolve_id("/site/child/index.njk").as_deref(),
            Some("/site/child/index.html")
        );
        assert_eq!(adapter.resolve_id("/site/main.js"), None);
        assert_eq!(adapter.resolve_id("/site/index.html"), None);

        let ids = adapter.ids.lock().unwrap();
        assert_eq!(
            ids.get("/site/child/index.html"),
            Some(&Utf8PathBuf::from("/site/child/index.njk"))
        );
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_load_renders_resolved_template() {
        let (_dir, root) = site(&[("index.njk", "<h3>{{ testVal }}</h3>")]);
        let adapter = adapter(
            &root,
            RenderOptions::default().context(context! { testVal => "VAL" }),
        );

        let id = adapter.resolve_id(root.join("index.njk").as_str()).unwrap();
        let html = adapter.load(&id).await.unwrap();
        assert_eq!(html.as_deref(), Some("<h3>VAL</h3>"));
    }

    #[tokio::test]
    async fn test_load_relative_template() {
        let (_dir, root) = site(&[("about.njk", "about")]);
        let adapter = adapter(&root, RenderOptions::default());

        let id = adapter.resolve_id("about.njk").unwrap();
        assert_eq!(id, "about.html");
        assert_eq!(adapter.load(&id).await.unwrap().as_deref(), Some("about"));
    }

    #[tokio::test]
    async fn test_load_literal_markup() {
        let (_dir, root) = site(&[("plain.html", "<p>plain</p>")]);
        let adapter = adapter(&root, RenderOptions::default());

        let html = adapter.load(root.join("plain.html").as_str()).await.unwrap();
        assert_eq!(html.as_deref(), Some("<p>plain</p>"));
    }

    #[tokio::test]
    async fn test_load_relative_markup_from_root() {
        let (_dir, root) = site(&[("pages/plain.html", "<p>nested</p>")]);
        let adapter = adapter(&root, RenderOptions::default());

        let html = adapter.load("pages/plain.html").await.unwrap();
        assert_eq!(html.as_deref(), Some("<p>nested</p>"));
    }

    #[tokio::test]
    async fn test_load_declines_other_ids() {
        let adapter = BuildAdapter::new(RenderOptions::default());
        assert!(adapter.load("/site/app.js").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_propagates_render_failure() {
        let (_dir, root) = site(&[("bad.njk", "{% for %}")]);
        let adapter = adapter(&root, RenderOptions::default());

        let id = adapter.resolve_id(root.join("bad.njk").as_str()).unwrap();
        let err = adapter.load(&id).await.unwrap_err();
        assert!(matches!(err, BuildError::Render(_)));
    }

    #[tokio::test]
    async fn test_bundle_writes_pages() {
        let (_dir, root) = site(&[
            ("index.njk", "<h3>{{ testVal }}</h3>"),
            ("child/index.njk", "<h1>CHILD</h1>"),
            ("static.html", "<p>static</p>"),
        ]);
        let dist = root.join("dist");
        let adapter = adapter(
            &root,
            RenderOptions::default().context(context! { testVal => "VAL" }),
        );

        let pages = bundle(&adapter, &["index.njk", "child/index.njk", "static.html"], &dist)
            .await
            .unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(
            fs::read_to_string(dist.join("index.html")).unwrap(),
            "<h3>VAL</h3>"
        );
        assert_eq!(
            fs::read_to_string(dist.join("child/index.html")).unwrap(),
            "<h1>CHILD</h1>"
        );
        assert_eq!(
            fs::read_to_string(dist.join("static.html")).unwrap(),
            "<p>static</p>"
        );
    }

    #[tokio::test]
    async fn test_bundle_rejects_unknown_entry() {
        let (_dir, root) = site(&[]);
        let adapter = adapter(&root, RenderOptions::default());

        let err = bundle(&adapter, &["app.js"], root.join("dist"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::NotTemplate(_)));
    }
}
