//! Reference dev server.
//!
//! A small host for [`ServeAdapter`]: static files are served from the root
//! with `tower-http`, and every request first goes through the adapter.
//! [`Host`] keeps the module graph in memory and, when live reload is on,
//! injects a client script into every rendered page.
//!
//! ```rust,no_run
//! # fn main() -> Result<(), tsuzuri::TsuzuriError> {
//! let plugins = tsuzuri::Settings::new().finish()?;
//! tsuzuri::server::serve(plugins.serve, "site", 8080)?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

use crate::error::{HostError, TsuzuriError};
use crate::graph::MemoryGraph;
use crate::host::{DevServer, ModuleGraph, ReloadEvent, Response, TransformResult};
use crate::serve::{Outcome, ServeAdapter};
use crate::utils::{absolute, normalize_path};

/// Dev server state shared between requests.
#[derive(Debug)]
pub struct Host {
    root: Utf8PathBuf,
    graph: Mutex<MemoryGraph>,
    live: Option<LiveReload>,
}

#[derive(Debug)]
struct LiveReload {
    port: u16,
    sender: Sender<()>,
}

impl Host {
    /// Creates a host serving `root`. Symlinks in an existing root are
    /// resolved, so file events and graph paths agree.
    pub fn new(root: impl AsRef<Utf8Path>) -> std::io::Result<Self> {
        let root = normalize_path(&absolute(root.as_ref())?);

        Ok(Self {
            root: root.canonicalize_utf8().unwrap_or(root),
            graph: Mutex::new(MemoryGraph::new()),
            live: None,
        })
    }

    /// Pages get a script connecting to the websocket at `port`, and
    /// reload events are forwarded to `sender`.
    pub fn live_reload(mut self, port: u16, sender: Sender<()>) -> Self {
        self.live = Some(LiveReload { port, sender });
        self
    }

    pub fn graph(&self) -> MutexGuard<'_, MemoryGraph> {
        self.graph.lock().unwrap()
    }

    fn refresh_script(&self) -> Option<String> {
        self.live.as_ref().map(|live| {
            format!(
                r#"<script>
const socket = new WebSocket("ws://localhost:{}");
socket.addEventListener("message", event => {{
    window.location.reload();
}});
</script>"#,
                live.port
            )
        })
    }
}

impl DevServer for Host {
    type Graph = MemoryGraph;

    fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn with_graph<R>(&self, f: impl FnOnce(&mut MemoryGraph) -> R) -> R {
        f(&mut self.graph.lock().unwrap())
    }

    async fn transform_request(&self, url: &str) -> Result<Option<TransformResult>, HostError> {
        let graph = self.graph.lock().unwrap();

        Ok(graph
            .module_by_url(url)
            .and_then(|id| graph.transform_result(id))
            .cloned())
    }

    async fn transform_index_html(&self, _: &str, html: String) -> Result<String, HostError> {
        let Some(script) = self.refresh_script() else {
            return Ok(html);
        };

        Ok(match html.rfind("</body>") {
            Some(i) => format!("{}{}{}", &html[..i], script, &html[i..]),
            None => html + &script,
        })
    }

    fn broadcast(&self, event: ReloadEvent) {
        let Some(live) = &self.live else {
            return;
        };

        match event {
            ReloadEvent::FullReload => {
                if live.sender.send(()).is_err() {
                    tracing::warn!("reload channel closed");
                }
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    host: Arc<Host>,
    adapter: Arc<ServeAdapter>,
}

/// Router serving the host's root, with `adapter` intercepting every request.
pub fn router(host: Arc<Host>, adapter: Arc<ServeAdapter>) -> Router {
    let files = ServeDir::new(host.root());

    Router::new()
        .fallback_service(files)
        .layer(middleware::from_fn_with_state(
            AppState { host, adapter },
            intercept,
        ))
}

async fn intercept(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> axum::response::Response {
    let raw_url = request
        .uri()
        .path_and_query()
        .map(|target| target.as_str())
        .unwrap_or("/")
        .to_string();

    match state.adapter.handle(state.host.as_ref(), &raw_url).await {
        Outcome::Next => next.run(request).await,
        Outcome::Respond(response) => into_response(response),
        Outcome::Fail(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn into_response(response: Response) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

/// Starts the HTTP server on its own thread.
pub fn start(
    host: Arc<Host>,
    adapter: Arc<ServeAdapter>,
    port: u16,
) -> thread::JoinHandle<Result<(), TsuzuriError>> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "starting a HTTP server");

    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TsuzuriError::RuntimeBuild)?
            .block_on(listen(router(host, adapter), port))
            .map_err(TsuzuriError::Server)
    })
}

async fn listen(router: Router, port: u16) -> std::io::Result<()> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    axum::serve(address, router).await
}

/// Serves `root` with `adapter` until the server stops. With the `live`
/// feature, changes under the root and the search paths reload the
/// connected pages.
pub fn serve(
    adapter: ServeAdapter,
    root: impl AsRef<Utf8Path>,
    port: u16,
) -> Result<(), TsuzuriError> {
    let host = Host::new(root).map_err(TsuzuriError::Server)?;

    #[cfg(feature = "live")]
    let (host, watched) = {
        let (ws_port, sender) = crate::watch::open_socket()?;
        let watched = adapter.watched_paths(host.root());
        (host.live_reload(ws_port, sender), watched)
    };

    let host = Arc::new(host);
    let adapter = Arc::new(adapter);

    #[cfg(feature = "live")]
    let _watcher = crate::watch::spawn_watcher(host.clone(), adapter.clone(), watched)?;

    match start(host, adapter, port).join() {
        Ok(result) => result,
        Err(_) => Err(TsuzuriError::Server(std::io::Error::other(
            "HTTP server thread panicked",
        ))),
    }
}
