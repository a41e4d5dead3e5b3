//! Correlating client for the daemon socket.
//!
//! A background read loop routes responses to their pending requests by id
//! and hands events to the registered callback.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, TransportError};
use crate::protocol::{Message, MsgType};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

type EventHandler = Box<dyn Fn(Message) + Send + Sync>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Connects to a stasiumd server over a Unix domain socket.
pub struct Client {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    events: Arc<std::sync::Mutex<Option<EventHandler>>>,
    done: CancellationToken,
}

impl Client {
    /// Dial the daemon socket with a 5 s timeout.
    pub async fn connect(socket_path: &Path) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(socket_path))
            .await
            .map_err(|_| TransportError::Timeout(DIAL_TIMEOUT))?
            .map_err(|e| io_err(socket_path, e))?;

        let (reader, writer) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let events: Arc<std::sync::Mutex<Option<EventHandler>>> =
            Arc::new(std::sync::Mutex::new(None));
        let done = CancellationToken::new();

        tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&events),
            done.clone(),
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            events,
            done,
        })
    }

    /// Register a handler for server-pushed events. Events arriving before
    /// registration are discarded.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.events.lock() {
            *slot = Some(Box::new(handler));
        }
    }

    /// Send a request and await its correlated response. A non-empty server
    /// `error` surfaces as [`TransportError::Server`].
    pub async fn request(
        &self,
        req_method: &str,
        data: Option<Value>,
    ) -> Result<Message, TransportError> {
        let msg = Message::request(req_method, data);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg.id.clone(), tx);

        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');

        let write_result = {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await
        };
        if let Err(err) = write_result {
            self.pending.lock().await.remove(&msg.id);
            return Err(io_err("client socket", err));
        }

        let outcome = tokio::select! {
            _ = self.done.cancelled() => Err(TransportError::ConnectionClosed),
            resp = rx => match resp {
                Ok(resp) if resp.error.is_empty() => Ok(resp),
                Ok(resp) => Err(TransportError::Server(resp.error)),
                Err(_) => Err(TransportError::ConnectionClosed),
            },
        };

        // The read loop removes the entry when routing; clean up the leftover
        // on the closed-connection path.
        if outcome.is_err() {
            self.pending.lock().await.remove(&msg.id);
        }
        outcome
    }

    /// [`Client::request`] with a deadline.
    pub async fn request_with_timeout(
        &self,
        req_method: &str,
        data: Option<Value>,
        deadline: Duration,
    ) -> Result<Message, TransportError> {
        tokio::time::timeout(deadline, self.request(req_method, data))
            .await
            .map_err(|_| TransportError::Timeout(deadline))?
    }

    /// Close the connection; outstanding requests fail with
    /// [`TransportError::ConnectionClosed`].
    pub fn close(&self) {
        self.done.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

async fn read_loop(
    reader: OwnedReadHalf,
    pending: PendingMap,
    events: Arc<std::sync::Mutex<Option<EventHandler>>>,
    done: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = done.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let msg: Message = match serde_json::from_str(&line) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                match msg.msg_type {
                    MsgType::Res => {
                        if let Some(tx) = pending.lock().await.remove(&msg.id) {
                            let _ = tx.send(msg);
                        }
                    }
                    MsgType::Evt => {
                        if let Ok(slot) = events.lock() {
                            if let Some(handler) = slot.as_ref() {
                                handler(msg);
                            }
                        }
                    }
                    MsgType::Req => {}
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    done.cancel();
}
