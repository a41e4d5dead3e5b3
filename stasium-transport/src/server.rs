//! Unix-socket server: accept loop, per-connection dispatch, event fan-out.
//!
//! Each connection gets a reader task and a bounded outbox drained by a writer
//! task. Responses and broadcasts share the outbox, so a client observes them
//! in a single order; a slow client's full outbox blocks the broadcaster
//! rather than dropping events.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, TransportError};
use crate::protocol::{Message, MsgType, MAX_LINE_BYTES};

/// Outbox depth per client; a client this far behind blocks the broadcaster.
const OUTBOX_DEPTH: usize = 64;

/// The boxed future a handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// A registered request handler. Errors are surfaced to the client as the
/// response's `error` string.
pub type Handler = Box<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Listens on a Unix domain socket and dispatches NDJSON messages.
pub struct Server {
    socket_path: std::path::PathBuf,
    handlers: RwLock<HashMap<String, Handler>>,
    clients: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_client: AtomicU64,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(socket_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handlers: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a handler for a method.
    pub fn handle<F>(&self, method: &str, handler: F)
    where
        F: Fn(Message) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(method.to_owned(), Box::new(handler));
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Begin listening, removing any stale socket file first. Blocks until
    /// `cancel` fires or [`Server::close`] is called.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), TransportError> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&self.socket_path, err)),
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| io_err(&self.socket_path, e))?;
        tracing::info!(socket = %self.socket_path.display(), "server listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::error!(error = %err, "accept error");
                            continue;
                        }
                    };
                    let server = Arc::clone(self);
                    let conn_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        server.handle_conn(stream, conn_cancel).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Send an event to every currently connected client, in order per client.
    pub async fn broadcast(&self, msg: &Message) {
        let line = match encode_line(msg) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "broadcast encode error");
                return;
            }
        };

        let outboxes: Vec<mpsc::Sender<String>> = {
            let clients = self.clients.lock().await;
            clients.values().cloned().collect()
        };
        for outbox in outboxes {
            // A closed outbox means the client is mid-disconnect; the next
            // accept/remove cycle cleans it up.
            if outbox.send(line.clone()).await.is_err() {
                tracing::debug!("broadcast to disconnecting client dropped");
            }
        }
    }

    /// Number of currently connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Stop accepting, drop all clients, and remove the socket file.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, "failed to remove socket file");
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: UnixStream, cancel: CancellationToken) {
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();

        let (outbox_tx, outbox_rx) = mpsc::channel::<String>(OUTBOX_DEPTH);
        self.clients.lock().await.insert(client_id, outbox_tx.clone());
        tokio::spawn(drain_outbox(writer, outbox_rx));

        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.len() > MAX_LINE_BYTES {
                                tracing::warn!(client_id, len = line.len(), "oversize line, dropping connection");
                                break;
                            }
                            self.dispatch(&line, &outbox_tx).await;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(client_id, error = %err, "connection read error");
                            break;
                        }
                    }
                }
            }
        }

        self.clients.lock().await.remove(&client_id);
    }

    async fn dispatch(&self, line: &str, outbox: &mpsc::Sender<String>) {
        let msg: Message = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(error = %err, "invalid message");
                return;
            }
        };

        // Only requests trigger work; anything else from a client is ignored.
        if msg.msg_type != MsgType::Req {
            return;
        }

        let id = msg.id.clone();
        let req_method = msg.method.clone();

        // Build the future under the read lock; await it after release.
        let pending = {
            let handlers = self.handlers.read();
            handlers.get(&msg.method).map(|handler| handler(msg))
        };
        let response = match pending {
            None => Message::error_response(&id, &req_method, format!("unknown method: {req_method}")),
            Some(pending) => match pending.await {
                Ok(Value::Null) => Message::response(&id, &req_method, None),
                Ok(data) => Message::response(&id, &req_method, Some(data)),
                Err(err) => Message::error_response(&id, &req_method, err),
            },
        };

        match encode_line(&response) {
            Ok(line) => {
                if outbox.send(line).await.is_err() {
                    tracing::debug!("response dropped: client outbox closed");
                }
            }
            Err(err) => tracing::error!(error = %err, "response encode error"),
        }
    }
}

async fn drain_outbox(mut writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<String>) {
    while let Some(line) = outbox.recv().await {
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(error = %err, "client write error");
            break;
        }
    }
}

fn encode_line(msg: &Message) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}
