#![forbid(unsafe_code)]
//! Template pages for a bundler and its dev server.
//!
//! A page is a `.njk` template sitting where its `.html` output would be.
//! During a build, [`BuildAdapter`] rewrites references to templates into
//! markup ids and renders them on load. During development, [`ServeAdapter`]
//! answers requests for missing `.html` files by rendering the template next
//! to them, and wires the templates each page includes into the dev server's
//! module graph so that editing a layout reloads every page built from it.
//!
//! ```rust,no_run
//! use tsuzuri::minijinja::context;
//! use tsuzuri::{RenderOptions, Settings};
//!
//! # fn main() -> Result<(), tsuzuri::TsuzuriError> {
//! let plugins = Settings::new()
//!     .serve_options(RenderOptions::default().context(context! { title => "Home" }))
//!     .ignore_pattern("/admin/**")
//!     .finish()?;
//! # let _ = plugins;
//! # Ok(())
//! # }
//! ```

mod build;
mod error;
mod graph;
mod host;
mod ignore;
mod include;
#[cfg(feature = "logging")]
mod logging;
mod render;
mod serve;
#[cfg(feature = "server")]
pub mod server;
mod utils;
#[cfg(feature = "live")]
mod watch;

pub use minijinja;

pub use crate::build::{BuildAdapter, Page, bundle};
pub use crate::error::*;
pub use crate::graph::{MemoryGraph, ModuleNode};
pub use crate::host::{DevServer, ModuleGraph, ReloadEvent, Response, TransformResult};
pub use crate::ignore::IgnoreMatcher;
pub use crate::include::{IncludeGraph, IncludeIndex, ScanIncludeGraph, flatten};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::render::{
    Callback, ContextFn, EngineOptions, Loader, ManageEnv, Paths, RenderContext, RenderOptions,
    Undefined, render,
};
pub use crate::serve::{Outcome, ServeAdapter};

/// Extension of template sources.
pub const TEMPLATE_EXT: &str = "njk";

/// Extension of rendered pages, and of the requests that are intercepted.
pub const MARKUP_EXT: &str = "html";

/// File served for a URL that ends in `/`.
pub const DEFAULT_DOCUMENT: &str = "index.html";

/// This value controls whether the plugins run as part of a one-shot `Build`
/// or behind a long-running dev server in `Serve` mode. A process runs in one
/// mode only, and only the matching adapter does any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Render pages once and write them out.
    Build,
    /// Render pages on request and keep the module graph in sync.
    Serve,
}

/// User configuration shared by both adapters.
///
/// Build and serve render options are independent, either one defaults to
/// [`RenderOptions::default`].
#[derive(Debug, Clone)]
pub struct Settings {
    build: RenderOptions,
    serve: RenderOptions,
    ignore: Vec<String>,
    reload: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build: RenderOptions::default(),
            serve: RenderOptions::default(),
            ignore: Vec::new(),
            reload: true,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_options(mut self, options: RenderOptions) -> Self {
        self.build = options;
        self
    }

    pub fn serve_options(mut self, options: RenderOptions) -> Self {
        self.serve = options;
        self
    }

    /// Adds a glob of URLs the dev server should never intercept.
    pub fn ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ignore.push(pattern.into());
        self
    }

    pub fn ignore_patterns<S>(mut self, patterns: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        self.ignore.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Whether a change to a tracked file should reload connected clients.
    /// On by default.
    pub fn reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }

    /// Builds both adapters. Ignore patterns are compiled here, so an invalid
    /// pattern fails before anything is served.
    pub fn finish(self) -> Result<Plugins, TsuzuriError> {
        let ignore = IgnoreMatcher::new(&self.ignore)?;

        Ok(Plugins {
            build: BuildAdapter::new(self.build),
            serve: ServeAdapter::new(self.serve, ignore, self.reload),
        })
    }
}

/// The pair of adapters registered with the host.
#[derive(Debug)]
pub struct Plugins {
    pub build: BuildAdapter,
    pub serve: ServeAdapter,
}
