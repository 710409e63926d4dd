//! Live reload for the development server.
//!
//! Browsers load the bundle from the HTTP server in [`http`] and keep a
//! WebSocket session open with the [`ReloadChannel`]. After a rebuild the
//! channel broadcasts a [`Signal`] to every session: stylesheets are swapped
//! in place, everything else reloads the page.

#[cfg(feature = "server")]
pub mod http;

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tungstenite::{Message, WebSocket};

use crate::error::BuildError;
use crate::pipeline::{Artifact, Stage};

/// Port of the reload channel, unless it's taken.
pub const RELOAD_PORT: u16 = 1337;

/// A client gets this long to complete the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// A session that can't take a signal within this long is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Message sent to the browser, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Signal {
    /// Reload the whole page.
    Reload,
    /// Refetch the stylesheets at these paths, relative to the server root.
    Style { paths: Vec<String> },
    /// Show a message, used for build errors.
    Notice { message: String },
}

/// A connected client.
pub trait Session: Send {
    fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

    fn close(&mut self) {}
}

impl Session for WebSocket<TcpStream> {
    fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.send(Message::text(text))?;
        Ok(())
    }

    fn close(&mut self) {
        WebSocket::close(self, None).ok();
        self.flush().ok();
    }
}

type Shared = Arc<Mutex<Box<dyn Session>>>;

/// The set of live sessions.
///
/// Every session has its own lock, so a client that is slow to read only
/// delays the signals sent to itself.
#[derive(Clone, Default)]
pub struct ReloadChannel {
    sessions: Arc<Mutex<Vec<Shared>>>,
    port: Option<u16>,
}

impl ReloadChannel {
    /// Oldest sessions are closed once there are more than this.
    pub const MAX_SESSIONS: usize = 10;

    /// A channel without a listener, sessions can only be attached by hand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts accepting WebSocket sessions on [`RELOAD_PORT`], or on a free
    /// port if that one is taken.
    pub fn bind() -> io::Result<(Self, JoinHandle<()>)> {
        let (listener, port) = reserve_port()?;

        let channel = Self {
            sessions: Arc::default(),
            port: Some(port),
        };

        let thread = {
            let channel = channel.clone();
            thread::spawn(move || channel.accept(listener))
        };

        tracing::debug!("reload channel listening on port {port}");
        Ok((channel, thread))
    }

    fn accept(&self, listener: TcpListener) {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("reload channel: {e}");
                    continue;
                }
            };

            let channel = self.clone();
            thread::spawn(move || channel.handshake(stream));
        }
    }

    fn handshake(&self, stream: TcpStream) {
        let timeouts = stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)));

        if let Err(e) = timeouts {
            tracing::debug!("rejected reload session: {e}");
            return;
        }

        match tungstenite::accept(stream) {
            Ok(socket) => self.attach(socket),
            Err(e) => tracing::debug!("rejected reload session: {e}"),
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn attach(&self, session: impl Session + 'static) {
        let evicted: Vec<Shared> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.push(Arc::new(Mutex::new(Box::new(session))));

            let len = sessions.len();
            let over = len.saturating_sub(Self::MAX_SESSIONS);
            sessions.drain(0..over).collect()
        };

        for session in evicted {
            // a session busy with a broadcast goes away without a close frame
            if let Ok(mut session) = session.try_lock() {
                session.close();
            }
        }
    }

    pub fn sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Sends the signal to every session. Sessions that fail to receive it
    /// are dropped.
    pub fn broadcast(&self, signal: &Signal) {
        let text = match serde_json::to_string(signal) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("couldn't encode {signal:?}: {e}");
                return;
            }
        };

        let sessions: Vec<Shared> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.clone()
        };

        let mut dead = Vec::new();
        for session in &sessions {
            let mut guard = session.lock().unwrap_or_else(|e| e.into_inner());
            if guard.send_text(&text).is_err() {
                dead.push(session.clone());
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.retain(|session| !dead.iter().any(|d| Arc::ptr_eq(session, d)));
        }

        tracing::debug!(
            "sent {text} to {} session(s), dropped {}",
            sessions.len() - dead.len(),
            dead.len()
        );
    }

    pub fn notify_full_reload(&self) {
        self.broadcast(&Signal::Reload);
    }

    pub fn notify_style_patch(&self, paths: Vec<String>) {
        self.broadcast(&Signal::Style { paths });
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.broadcast(&Signal::Notice {
            message: message.into(),
        });
    }
}

impl std::fmt::Debug for ReloadChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadChannel")
            .field("port", &self.port)
            .field("sessions", &self.sessions())
            .finish()
    }
}

fn reserve_port() -> io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind(("127.0.0.1", RELOAD_PORT)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Browser side of the reload channel.
pub fn client_script(port: u16) -> String {
    format!(
        r#"<script>
(() => {{
    const socket = new WebSocket("ws://localhost:{port}");
    socket.addEventListener("message", event => {{
        const signal = JSON.parse(event.data);
        switch (signal.kind) {{
            case "style":
                for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {{
                    const url = new URL(link.href);
                    if (signal.paths.some(path => url.pathname.endsWith(path))) {{
                        url.searchParams.set("t", Date.now());
                        link.href = url.href;
                    }}
                }}
                break;
            case "notice":
                console.warn("[tsukuri]", signal.message);
                break;
            default:
                window.location.reload();
        }}
    }});
}})();
</script>
"#
    )
}

/// Puts the [`client_script`] into HTML documents, right before the last
/// `</body>` in any letter case, or at the end when there is none.
#[derive(Debug, Clone)]
pub struct InjectReload {
    script: String,
}

impl InjectReload {
    pub fn new(port: u16) -> Self {
        Self {
            script: client_script(port),
        }
    }
}

impl Stage for InjectReload {
    fn name(&self) -> &'static str {
        "reload"
    }

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let text = input.text()?;

        let html = match text.to_ascii_lowercase().rfind("</body>") {
            Some(at) => format!("{}{}{}", &text[..at], self.script, &text[at..]),
            None => format!("{text}{}", self.script),
        };

        Ok(vec![input.with_bytes(html.into_bytes())])
    }
}
