//! Live reload.
//!
//! Two parts run next to the HTTP server:
//!
//! 1. **File watcher**: a debounced `notify` watcher over the served root and
//!    the template search paths. Every changed file is handed to
//!    [`ServeAdapter::handle_hot_update`], which invalidates the pages that
//!    include it and broadcasts a reload through the host.
//! 2. **WebSocket server**: a `tungstenite` thread accepting browser
//!    connections, and another pushing `"reload"` to all of them whenever
//!    the host forwards a reload event.

use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;
use tungstenite::WebSocket;

use crate::error::WatchError;
use crate::host::DevServer;
use crate::serve::ServeAdapter;
use crate::utils::normalize_path;

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Port the reload socket tries before falling back to any free one.
const PREFERRED_PORT: u16 = 1337;

/// Opens the websocket clients connect to. Returns its port and the channel
/// that makes every connected client reload.
pub(crate) fn open_socket() -> Result<(u16, Sender<()>), WatchError> {
    let listener = bind_local(PREFERRED_PORT)?;
    let port = listener.local_addr()?.port();
    let clients = Arc::new(Mutex::new(vec![]));

    let _thread_i = new_thread_ws_incoming(listener, clients.clone());
    let (tx_reload, _thread_o) = new_thread_ws_reload(clients);

    tracing::info!(port, "live reload socket open");
    Ok((port, tx_reload))
}

/// A recursively watched directory, next to the spelling the OS may use for
/// it in events.
#[derive(Debug)]
struct WatchRoot {
    path: Utf8PathBuf,
    canonical: Utf8PathBuf,
}

/// Watches `paths` recursively and feeds every change to `adapter`.
pub(crate) fn spawn_watcher<S>(
    server: Arc<S>,
    adapter: Arc<ServeAdapter>,
    paths: HashSet<Utf8PathBuf>,
) -> Result<JoinHandle<()>, WatchError>
where
    S: DevServer + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(250), None, tx)?;
    let mut roots = Vec::new();

    for path in collapse_watch_paths(paths) {
        if !path.is_dir() {
            tracing::warn!(%path, "not a directory, skipping");
            continue;
        }
        tracing::info!("watching {}", path);
        debouncer.watch(&path, RecursiveMode::Recursive)?;

        let canonical = path.canonicalize_utf8()?;
        roots.push(WatchRoot { path, canonical });
    }

    Ok(std::thread::spawn(move || {
        // Dropping the debouncer stops the watch.
        let _debouncer = debouncer;

        loop {
            match rx.recv() {
                Ok(Ok(events)) => {
                    let mut changed = HashSet::new();
                    for de in events {
                        if matches!(de.event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in &de.event.paths {
                            if let Some(path) = Utf8Path::from_path(path) {
                                changed.insert(respell(&roots, path));
                            }
                        }
                    }

                    for path in changed {
                        tracing::debug!(%path, "file changed");
                        adapter.handle_hot_update(server.as_ref(), &path);
                    }
                }
                Ok(Err(errors)) => {
                    for e in errors {
                        tracing::error!("watch error: {e}");
                    }
                }
                Err(_) => {
                    tracing::warn!("watcher stopped");
                    break;
                }
            }
        }
    }))
}

/// Rewrites an event path reported under a root's canonical location, such
/// as `/private/var` for `/var` on macOS, back to the path the root was
/// registered with, which is how the module graph knows the file.
fn respell(roots: &[WatchRoot], path: &Utf8Path) -> Utf8PathBuf {
    let path = normalize_path(path);

    roots
        .iter()
        .filter(|root| root.path != root.canonical)
        .find_map(|root| path.strip_prefix(&root.canonical).ok().map(|rest| root.path.join(rest)))
        .unwrap_or(path)
}

fn bind_local(preferred: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", preferred)).or_else(|err| {
        tracing::debug!(preferred, "port unavailable: {err}");
        TcpListener::bind(("127.0.0.1", 0))
    })
}

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let socket = match stream.map_err(WatchError::from).and_then(|stream| {
                tungstenite::accept(stream).map_err(|e| WatchError::Handshake(e.to_string()))
            }) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("rejected websocket client: {e}");
                    continue;
                }
            };
            clients.lock().unwrap().push(socket);
        }
    })
}

fn new_thread_ws_reload(clients: Clients) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel::<()>();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            // A batch of changed files sends one request each, one reload
            // covers them all.
            while rx.try_recv().is_ok() {}

            let mut clients = clients.lock().unwrap();
            clients.retain_mut(|socket| match socket.send("reload".into()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::debug!("dropping websocket client: {err}");
                    false
                }
            });
            tracing::debug!(clients = clients.len(), "reload sent");
        }
    });

    (tx, thread)
}

/// Reduces a set of directories to the minimal set of recursive watch roots.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut roots: Vec<_> = paths.into_iter().collect();
    roots.sort();
    // Sorted, a nested directory follows the root containing it.
    roots.dedup_by(|path, root| path.starts_with(root));
    roots
}
