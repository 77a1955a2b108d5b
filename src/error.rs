use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as HostError;

#[derive(Debug, Error)]
pub enum TsuzuriError {
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[cfg(feature = "server")]
    #[error("Failed to build runtime")]
    RuntimeBuild(#[source] std::io::Error),

    #[cfg(feature = "server")]
    #[error("Error while serving pages:\n{0}")]
    Server(#[source] std::io::Error),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

/// The template engine failed to compile or execute a template.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template '{0}':\n{1:#}")]
    Engine(Utf8PathBuf, minijinja::Error),

    #[error("Template '{0}': render worker stopped before completing")]
    Cancelled(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Entry '{0}' is not a template")]
    NotTemplate(String),

    #[error("Entry '{0}' resolved to '{1}', which is outside of the root")]
    OutsideRoot(String, Utf8PathBuf),
}

/// Failures forwarded to the host's error channel by the dev-server
/// interceptor. The host turns any of these into a 500-class response.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Couldn't read the include graph.\n{0}")]
    Include(#[from] IncludeError),

    #[error("Background worker failed.\n{0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Host failed to transform '{0}':\n{1}")]
    Host(String, HostError),

    #[error("An unexpected error has occurred.")]
    UnexpectedState,
}

#[derive(Debug, Error)]
pub enum IncludeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Websocket handshake failed: {0}")]
    Handshake(String),
}
