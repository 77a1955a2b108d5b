//! Rendering of a single template file into markup.
//!
//! This is the one primitive shared by the build and serve adapters. Every
//! call constructs a fresh [`Environment`], lets the caller customize it,
//! computes the context and runs the engine on a blocking worker. Nothing is
//! reused between calls, so concurrent renders never contend over engine
//! state.

use std::borrow::Cow;
use std::fmt::Debug;
use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use minijinja::{AutoEscape, Environment, UndefinedBehavior, Value, context};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::RenderError;
use crate::utils::{normalize_path, relative_to};

/// Custom source loader, replacing the search path lookup.
pub type Loader = Arc<dyn Fn(&str) -> Result<Option<String>, minijinja::Error> + Send + Sync>;

/// Called once per render with the live engine, before rendering.
pub type ManageEnv = Arc<dyn Fn(&mut Environment<'static>, &Paths) + Send + Sync>;

/// Computes template variables for the template being rendered.
pub type ContextFn = Arc<dyn Fn(&Paths) -> Value + Send + Sync>;

/// Rewrites the final markup.
pub type Callback = Arc<dyn Fn(String, &Paths, Option<&RenderError>) -> String + Send + Sync>;

/// Both identities of the template being rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Absolute path on disk.
    pub absolute: Utf8PathBuf,
    /// Path relative to the base directory, always with `/` separators.
    pub relative: String,
}

impl Paths {
    pub fn new(base_dir: &Utf8Path, file: &Utf8Path) -> Self {
        let relative = relative_to(&normalize_path(base_dir), &normalize_path(file));

        Self {
            absolute: file.to_path_buf(),
            relative: relative.as_str().replace('\\', "/"),
        }
    }
}

/// How the engine treats variables missing from the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Undefined {
    /// Missing values print as nothing.
    #[default]
    Lenient,
    /// Like lenient, attribute access on missing values is allowed too.
    Chainable,
    /// Any use of a missing value is an error.
    Strict,
}

impl From<Undefined> for UndefinedBehavior {
    fn from(value: Undefined) -> Self {
        match value {
            Undefined::Lenient => UndefinedBehavior::Lenient,
            Undefined::Chainable => UndefinedBehavior::Chainable,
            Undefined::Strict => UndefinedBehavior::Strict,
        }
    }
}

/// Options passed to the template engine on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub autoescape: bool,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub keep_trailing_newline: bool,
    pub undefined: Undefined,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            autoescape: true,
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: true,
            undefined: Undefined::Lenient,
        }
    }
}

impl EngineOptions {
    fn apply(&self, env: &mut Environment<'static>) {
        env.set_trim_blocks(self.trim_blocks);
        env.set_lstrip_blocks(self.lstrip_blocks);
        env.set_keep_trailing_newline(self.keep_trailing_newline);
        env.set_undefined_behavior(self.undefined.into());

        let autoescape = self.autoescape;
        env.set_auto_escape_callback(move |_| {
            if autoescape {
                AutoEscape::Html
            } else {
                AutoEscape::None
            }
        });
    }
}

/// Source of the template variables.
#[derive(Clone)]
pub enum RenderContext {
    /// Same variables for every template.
    Static(Value),
    /// Variables computed from the template's paths.
    Dynamic(ContextFn),
}

impl Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderContext::Static(value) => f.debug_tuple("Static").field(value).finish(),
            RenderContext::Dynamic(_) => write!(f, "Dynamic(*)"),
        }
    }
}

/// Everything needed to render a template, fixed when an adapter is
/// constructed.
///
/// # Example
///
/// ```rust
/// use tsuzuri::RenderOptions;
/// use tsuzuri::minijinja::context;
///
/// let options = RenderOptions::default()
///     .manage_env(|env, _| {
///         env.add_filter("hello", |s: String| format!("Hello {s}"));
///     })
///     .context_fn(|paths| context! { page => paths.relative.clone() });
/// ```
#[derive(Clone)]
pub struct RenderOptions {
    pub(crate) search_paths: Vec<Utf8PathBuf>,
    pub(crate) loader: Option<Loader>,
    pub(crate) engine: EngineOptions,
    pub(crate) manage_env: Option<ManageEnv>,
    pub(crate) context: Option<RenderContext>,
    pub(crate) callback: Option<Callback>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            search_paths: vec![Utf8PathBuf::from(".")],
            loader: None,
            engine: EngineOptions::default(),
            manage_env: None,
            context: None,
            callback: None,
        }
    }
}

impl Debug for RenderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderOptions")
            .field("search_paths", &self.search_paths)
            .field("loader", &self.loader.as_ref().map(|_| "*"))
            .field("engine", &self.engine)
            .field("manage_env", &self.manage_env.as_ref().map(|_| "*"))
            .field("context", &self.context)
            .field("callback", &self.callback.as_ref().map(|_| "*"))
            .finish()
    }
}

impl RenderOptions {
    /// Directories searched for templates, in order. Relative directories
    /// are resolved against the base directory at render time.
    pub fn search_paths<P>(mut self, paths: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<Utf8PathBuf>,
    {
        self.search_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the search path lookup with a custom source loader.
    pub fn loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&str) -> Result<Option<String>, minijinja::Error> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Registers a callback that can add filters, functions, globals or
    /// tests to the engine right before each render.
    pub fn manage_env<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Environment<'static>, &Paths) + Send + Sync + 'static,
    {
        self.manage_env = Some(Arc::new(f));
        self
    }

    /// Same context for every template.
    pub fn context(mut self, context: impl Serialize) -> Self {
        self.context = Some(RenderContext::Static(Value::from_serialize(context)));
        self
    }

    /// Context computed per template.
    pub fn context_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Paths) -> Value + Send + Sync + 'static,
    {
        self.context = Some(RenderContext::Dynamic(Arc::new(f)));
        self
    }

    /// Post-processes the rendered markup.
    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(String, &Paths, Option<&RenderError>) -> String + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }
}

impl RenderOptions {
    /// Search paths made absolute against `base_dir`.
    pub(crate) fn resolve_search_paths(&self, base_dir: &Utf8Path) -> Vec<Utf8PathBuf> {
        self.search_paths
            .iter()
            .map(|path| normalize_path(&base_dir.join(path)))
            .collect()
    }
}

/// Delivers the engine's result at most once. Later completions are dropped.
struct Completion<T> {
    sender: Option<oneshot::Sender<T>>,
}

impl<T> Completion<T> {
    fn new() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    fn complete(&mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            // The receiver is gone only if the request itself was dropped.
            let _ = sender.send(value);
        }
    }
}

/// Renders the template at `file` into markup.
///
/// `base_dir` is the root the relative template path is computed against,
/// and the directory relative search paths are resolved in.
pub async fn render(
    base_dir: &Utf8Path,
    file: &Utf8Path,
    options: &RenderOptions,
) -> Result<String, RenderError> {
    let mut env = Environment::new();
    options.engine.apply(&mut env);

    match &options.loader {
        Some(loader) => {
            let loader = loader.clone();
            env.set_loader(move |name| loader(name));
        }
        None => {
            env.set_loader(search_path_loader(options.resolve_search_paths(base_dir)));
        }
    }

    env.set_path_join_callback(|name, parent| {
        if name.starts_with("./") || name.starts_with("../") {
            let dir = Utf8Path::new(parent).parent().unwrap_or(Utf8Path::new(""));
            Cow::Owned(normalize_path(&dir.join(name)).into_string())
        } else {
            Cow::Borrowed(name)
        }
    });

    let paths = Paths::new(base_dir, file);

    if let Some(manage_env) = &options.manage_env {
        manage_env(&mut env, &paths);
    }

    let context = match &options.context {
        Some(RenderContext::Dynamic(f)) => f(&paths),
        Some(RenderContext::Static(value)) => value.clone(),
        None => context! {},
    };

    tracing::debug!(template = %paths.relative, "rendering");

    let (completion, receiver) = Completion::new();
    let name = file.to_string();

    tokio::task::spawn_blocking(move || {
        let mut completion = completion;
        let result = env
            .get_template(&name)
            .and_then(|template| template.render(context));
        completion.complete(result);
    });

    let markup = receiver
        .await
        .map_err(|_| RenderError::Cancelled(file.to_path_buf()))?
        .map_err(|err| RenderError::Engine(file.to_path_buf(), err))?;

    Ok(match &options.callback {
        Some(callback) => callback(markup, &paths, None),
        None => markup,
    })
}

fn search_path_loader(
    search_paths: Vec<Utf8PathBuf>,
) -> impl Fn(&str) -> Result<Option<String>, minijinja::Error> + Send + Sync + 'static {
    move |name| {
        let name = Utf8Path::new(name);

        if name.is_absolute() {
            return read_source(name);
        }

        for dir in &search_paths {
            if let Some(source) = read_source(&dir.join(name))? {
                return Ok(Some(source));
            }
        }

        Ok(None)
    }
}

fn read_source(path: &Utf8Path) -> Result<Option<String>, minijinja::Error> {
    match fs::read_to_string(path) {
        Ok(source) => Ok(Some(source)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("could not read template {path}"),
        )
        .with_source(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

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

    #[test]
    fn test_paths() {
        let paths = Paths::new(
            Utf8Path::new("/site"),
            Utf8Path::new("/site/./blog/post.njk"),
        );
        assert_eq!(paths.absolute, Utf8Path::new("/site/./blog/post.njk"));
        assert_eq!(paths.relative, "blog/post.njk");
    }

    #[test]
    fn test_completion_fires_once() {
        let (mut completion, mut receiver) = Completion::new();
        completion.complete(1);
        completion.complete(2);
        assert_eq!(receiver.try_recv().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_render_context_fn() {
        let (_dir, root) = site(&[("index.njk", "<h3>{{ testVal }}</h3>")]);

        let options = RenderOptions::default().context_fn(|paths| {
            context! { testVal => "VAL", file => paths.relative.clone() }
        });

        let html = render(&root, &root.join("index.njk"), &options)
            .await
            .unwrap();
        assert_eq!(html, "<h3>VAL</h3>");
    }

    #[tokio::test]
    async fn test_render_static_context() {
        let (_dir, root) = site(&[("a.njk", "{{ name }}")]);

        let options = RenderOptions::default().context(context! { name => "static" });
        let html = render(&root, &root.join("a.njk"), &options).await.unwrap();
        assert_eq!(html, "static");
    }

    #[tokio::test]
    async fn test_render_without_context() {
        let (_dir, root) = site(&[("a.njk", "[{{ missing }}]")]);

        let html = render(&root, &root.join("a.njk"), &RenderOptions::default())
            .await
            .unwrap();
        assert_eq!(html, "[]");
    }

    #[tokio::test]
    async fn test_manage_env_sees_paths() {
        let (_dir, root) = site(&[("blog/post.njk", "{{ 'World' | hello }} {{ here }}")]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = RenderOptions::default().manage_env({
            let seen = seen.clone();
            move |env, paths| {
                seen.lock().unwrap().push(paths.relative.clone());
                env.add_filter("hello", |s: String| format!("Hello {s}"));
                env.add_global("here", paths.relative.clone());
            }
        });

        let html = render(&root, &root.join("blog/post.njk"), &options)
            .await
            .unwrap();
        assert_eq!(html, "Hello World blog/post.njk");
        assert_eq!(*seen.lock().unwrap(), vec!["blog/post.njk".to_string()]);
    }

    #[tokio::test]
    async fn test_search_paths_and_relative_includes() {
        let (_dir, root) = site(&[
            ("partials/nav.njk", "<nav></nav>"),
            ("pages/local.njk", "local"),
            (
                "pages/index.njk",
                r#"{% include "partials/nav.njk" %}|{% include "./local.njk" %}"#,
            ),
        ]);

        let html = render(&root, &root.join("pages/index.njk"), &RenderOptions::default())
            .await
            .unwrap();
        assert_eq!(html, "<nav></nav>|local");
    }

    #[tokio::test]
    async fn test_custom_loader() {
        let options = RenderOptions::default().loader(|name| {
            Ok(match name {
                "/virtual/page.njk" => Some("{% include 'part' %}!".to_string()),
                "part" => Some("virtual".to_string()),
                _ => None,
            })
        });

        let html = render(
            Utf8Path::new("/virtual"),
            Utf8Path::new("/virtual/page.njk"),
            &options,
        )
        .await
        .unwrap();
        assert_eq!(html, "virtual!");
    }

    #[tokio::test]
    async fn test_callback_rewrites_output() {
        let (_dir, root) = site(&[("a.njk", "body")]);

        let options = RenderOptions::default().callback(|html, paths, err| {
            assert!(err.is_none());
            format!("<!-- {} -->{html}", paths.relative)
        });

        let html = render(&root, &root.join("a.njk"), &options).await.unwrap();
        assert_eq!(html, "<!-- a.njk -->body");
    }

    #[tokio::test]
    async fn test_autoescape() {
        let (_dir, root) = site(&[("a.njk", "{{ v }}")]);

        let options = RenderOptions::default().context(context! { v => "<b>" });
        let html = render(&root, &root.join("a.njk"), &options).await.unwrap();
        assert_eq!(html, "&lt;b&gt;");

        let options = options.engine(EngineOptions {
            autoescape: false,
            ..Default::default()
        });
        let html = render(&root, &root.join("a.njk"), &options).await.unwrap();
        assert_eq!(html, "<b>");
    }

    #[tokio::test]
    async fn test_strict_undefined_fails() {
        let (_dir, root) = site(&[("a.njk", "{{ missing }}")]);

        let options = RenderOptions::default().engine(EngineOptions {
            undefined: Undefined::Strict,
            ..Default::default()
        });

        let err = render(&root, &root.join("a.njk"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Engine(..)));
    }

    #[tokio::test]
    async fn test_syntax_error_is_reported() {
        let (_dir, root) = site(&[("bad.njk", "{% if %}")]);

        let called = Arc::new(Mutex::new(false));
        let options = RenderOptions::default().callback({
            let called = called.clone();
            move |html, _, _| {
                *called.lock().unwrap() = true;
                html
            }
        });

        let err = render(&root, &root.join("bad.njk"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Engine(path, _) if path == root.join("bad.njk")));
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn test_missing_template() {
        let (_dir, root) = site(&[]);

        let err = render(&root, &root.join("nope.njk"), &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Engine(..)));
    }

    #[test]
    fn test_engine_options_deserialize() {
        let options: EngineOptions =
            serde_json::from_str(r#"{ "autoescape": false, "undefined": "strict" }"#).unwrap();
        assert!(!options.autoescape);
        assert!(options.keep_trailing_newline);
        assert_eq!(options.undefined, Undefined::Strict);
    }
}
