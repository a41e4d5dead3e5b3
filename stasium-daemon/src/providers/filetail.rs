//! Log-source provider: tails files declared in the manifest.
//!
//! The native segment of a log-source item id is the file path itself, which
//! is why the id codec must keep delimiters inside the native segment intact.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use stasium_core::{parse_item_id, CoreError, LogLine, LogProvider};

const STREAM_LABEL: &str = "file";
const POLL_DELAY: Duration = Duration::from_millis(250);
const LOG_CHANNEL_DEPTH: usize = 100;

struct LogForward {
    sender: broadcast::Sender<LogLine>,
    cancel: CancellationToken,
}

/// Tails declared log files, starting at the current end.
#[derive(Default)]
pub struct FiletailProvider {
    forwards: Mutex<HashMap<String, LogForward>>,
}

impl FiletailProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogProvider for FiletailProvider {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        item_id: &str,
    ) -> Result<broadcast::Receiver<LogLine>, CoreError> {
        {
            let forwards = self.forwards.lock();
            if let Some(forward) = forwards.get(item_id) {
                return Ok(forward.sender.subscribe());
            }
        }

        let (_, _, native_id) = parse_item_id(item_id)?;
        let path = PathBuf::from(native_id);
        let mut file = tokio::fs::File::open(&path).await?;
        // Start at the end; only new lines are streamed.
        let start = file.seek(SeekFrom::End(0)).await?;

        let (sender, receiver) = broadcast::channel(LOG_CHANNEL_DEPTH);
        let forward_cancel = cancel.child_token();

        let task = TailTask {
            path: path.clone(),
            item_id: item_id.to_owned(),
            sender: sender.clone(),
            cancel: forward_cancel.clone(),
        };
        tokio::spawn(task.run(file, start));

        self.forwards.lock().insert(
            item_id.to_owned(),
            LogForward {
                sender,
                cancel: forward_cancel,
            },
        );
        tracing::info!(path = %path.display(), item_id, "tailing file");
        Ok(receiver)
    }

    fn unsubscribe(&self, item_id: &str) {
        if let Some(forward) = self.forwards.lock().remove(item_id) {
            forward.cancel.cancel();
        }
    }
}

struct TailTask {
    path: PathBuf,
    item_id: String,
    sender: broadcast::Sender<LogLine>,
    cancel: CancellationToken,
}

impl TailTask {
    async fn run(self, file: tokio::fs::File, start: u64) {
        let mut reader = BufReader::new(file);
        let mut position = start;
        let mut buf = String::new();

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            buf.clear();
            match reader.read_line(&mut buf).await {
                Ok(0) => {
                    // At EOF: poll, watching for truncation (file rotation).
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(POLL_DELAY) => {}
                    }
                    let Ok(meta) = tokio::fs::metadata(&self.path).await else {
                        continue;
                    };
                    if meta.len() < position {
                        if reader.seek(SeekFrom::Start(0)).await.is_ok() {
                            position = 0;
                        }
                    }
                }
                Ok(read) => {
                    position += read as u64;
                    let line = buf.trim_end_matches(['\n', '\r']).to_owned();
                    let entry = LogLine {
                        item_id: self.item_id.clone(),
                        ts_unix_ms: chrono::Utc::now().timestamp_millis(),
                        stream: STREAM_LABEL.to_owned(),
                        line,
                    };
                    let _ = self.sender.send(entry);
                }
                Err(err) => {
                    tracing::debug!(path = %self.path.display(), error = %err, "tail read error");
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
