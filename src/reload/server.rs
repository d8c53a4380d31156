//! WebSocket server for live reload.
//!
//! Accepts browser connections, relays build notices from the
//! [`LiveReloadHub`], and feeds inbound page heartbeats into the
//! [`ActivityTracker`]. Sockets are polled nonblocking on plain threads
//! so the server works the same inside and outside an async runtime.

use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tungstenite::{Message, WebSocket};

use crate::config::LiveReloadConfig;
use crate::reload::active::ActivityTracker;
use crate::reload::{LiveReloadHub, ReloadNotice};
use crate::{debug, log};

/// Maximum port retry attempts
const MAX_PORT_RETRIES: u16 = 10;

/// Accept poll interval when no connection is pending
const ACCEPT_POLL_MS: u64 = 100;

/// Client socket poll interval
const CLIENT_POLL_MS: u64 = 100;

type ClientList = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

// =============================================================================
// Wire Messages
// =============================================================================

/// JSON messages exchanged with browsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReloadMessage {
    /// Server to client: this page finished a rebuild.
    Build { path: String },
    /// Server to client: greeting sent right after the handshake.
    Connected { version: String },
    /// Client to server: heartbeat naming the page the tab is viewing.
    Page { path: String },
}

/// Extract the page path from an inbound heartbeat, if that is what
/// `text` is. Paths arrive percent-encoded.
fn parse_page_message(text: &str) -> Option<PathBuf> {
    match serde_json::from_str(text) {
        Ok(ReloadMessage::Page { path }) => {
            let decoded = percent_decode_str(&path).decode_utf8().ok()?;
            Some(PathBuf::from(decoded.into_owned()))
        }
        _ => None,
    }
}

// =============================================================================
// Server
// =============================================================================

/// Handle to a running live reload server.
///
/// Dropping the handle stops the acceptor and reader threads and closes
/// all client connections.
pub struct ReloadServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
}

impl ReloadServer {
    /// Bind a port near `config.port` and start serving.
    pub fn spawn(
        config: &LiveReloadConfig,
        hub: &LiveReloadHub,
        tracker: Arc<ActivityTracker>,
    ) -> Result<ReloadServer> {
        let (listener, port) = try_bind_port(config.port, MAX_PORT_RETRIES)?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let clients: ClientList = Arc::new(Mutex::new(Vec::new()));

        spawn_acceptor(listener, Arc::clone(&clients), Arc::clone(&shutdown));
        spawn_reader(Arc::clone(&clients), tracker, Arc::clone(&shutdown));
        spawn_notifier(hub.subscribe(), Arc::clone(&clients), Arc::clone(&shutdown));

        log!("reload"; "listening on ws://127.0.0.1:{}", port);

        Ok(ReloadServer { port, shutdown })
    }

    /// Port actually bound, which may differ from the configured one.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for ReloadServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind the first free port in `base_port..base_port + max_retries`.
///
/// Returns the listener together with the port it actually bound, so a
/// configured port of 0 resolves to whatever the OS handed out.
fn try_bind_port(base_port: u16, max_retries: u16) -> Result<(TcpListener, u16)> {
    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            let port = listener.local_addr()?.port();
            return Ok((listener, port));
        }
        debug!("reload"; "port {} taken, trying next", port);
    }

    bail!(
        "no free port in {}..{} for live reload",
        base_port,
        base_port.saturating_add(max_retries)
    )
}

// =============================================================================
// Worker Threads
// =============================================================================

fn spawn_acceptor(listener: TcpListener, clients: ClientList, shutdown: Arc<AtomicBool>) {
    thread::spawn(move || {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("reload"; "client connected: {}", addr);
                    if let Some(ws) = handshake(stream) {
                        clients.lock().push(ws);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                }
                Err(e) => {
                    debug!("reload"; "accept error: {}", e);
                    break;
                }
            }
        }
    });
}

/// Upgrade a raw connection to a WebSocket and greet the client.
///
/// The handshake needs a blocking socket; afterwards the stream goes
/// nonblocking so the reader thread can poll it.
fn handshake(stream: TcpStream) -> Option<WebSocket<TcpStream>> {
    stream.set_nonblocking(false).ok()?;

    let mut ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            debug!("reload"; "handshake failed: {}", e);
            return None;
        }
    };

    let greeting = ReloadMessage::Connected {
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Ok(json) = serde_json::to_string(&greeting) {
        let _ = ws.send(Message::Text(json.into()));
    }

    ws.get_ref().set_nonblocking(true).ok()?;
    Some(ws)
}

fn spawn_reader(clients: ClientList, tracker: Arc<ActivityTracker>, shutdown: Arc<AtomicBool>) {
    thread::spawn(move || {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                let mut clients = clients.lock();
                for ws in clients.iter_mut() {
                    let _ = ws.close(None);
                }
                clients.clear();
                break;
            }

            {
                let mut clients = clients.lock();
                let mut disconnected = Vec::new();

                for (i, ws) in clients.iter_mut().enumerate() {
                    // Drain everything the client has sent since the last poll.
                    loop {
                        match ws.read() {
                            Ok(Message::Text(text)) => {
                                if let Some(path) = parse_page_message(&text) {
                                    debug!("reload"; "heartbeat: {}", path.display());
                                    tracker.heartbeat(&path);
                                }
                            }
                            Ok(Message::Close(_)) => {
                                disconnected.push(i);
                                break;
                            }
                            Ok(_) => {}
                            Err(tungstenite::Error::Io(e))
                                if e.kind() == ErrorKind::WouldBlock =>
                            {
                                break;
                            }
                            Err(e) => {
                                debug!("reload"; "client read error: {}", e);
                                disconnected.push(i);
                                break;
                            }
                        }
                    }
                }

                for i in disconnected.into_iter().rev() {
                    debug!("reload"; "client disconnected");
                    clients.remove(i);
                }
            }

            thread::sleep(Duration::from_millis(CLIENT_POLL_MS));
        }
    });
}

fn spawn_notifier(
    mut rx: broadcast::Receiver<ReloadNotice>,
    clients: ClientList,
    shutdown: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        loop {
            let notice = match rx.blocking_recv() {
                Ok(notice) => notice,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("reload"; "dropped {} stale notices", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let message = ReloadMessage::Build {
                path: notice.path.display().to_string(),
            };
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };

            let mut clients = clients.lock();
            clients.retain_mut(|ws| ws.send(Message::Text(json.clone().into())).is_ok());
            debug!("reload"; "broadcast to {} clients: {}", clients.len(), notice.path.display());
        }
    });
}
