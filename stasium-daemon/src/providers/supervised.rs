//! Provider for supervised child processes, backed by the [`Supervisor`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use stasium_core::{parse_item_id, CoreError, Item, Kind, LogLine, LogProvider, Provider, Status};

use crate::supervisor::{Supervisor, PROVIDER_SEGMENT};

const LOG_CHANNEL_DEPTH: usize = 100;

struct LogForward {
    sender: broadcast::Sender<LogLine>,
    cancel: CancellationToken,
}

/// Lists and acts on supervised processes; streams their merged
/// stdout+stderr logs.
pub struct SupervisedProvider {
    supervisor: Arc<Supervisor>,
    forwards: Mutex<HashMap<String, LogForward>>,
}

impl SupervisedProvider {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            forwards: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Provider for SupervisedProvider {
    fn name(&self) -> &'static str {
        Kind::SupervisedProcess.as_str()
    }

    async fn list(&self, _cancel: CancellationToken) -> Result<Vec<Item>, CoreError> {
        let mut items = Vec::new();
        for name in self.supervisor.names() {
            let Some(status) = self.supervisor.status(&name) else {
                continue;
            };
            let mut item = Item::new(Kind::SupervisedProcess, PROVIDER_SEGMENT, &name, name.as_str());
            item.status = status.status;
            if status.pid > 0 {
                item.pids = vec![status.pid];
            }
            if status.status == Status::Running {
                if let Some(started_at) = status.started_at {
                    item.uptime_sec = started_at.elapsed().as_secs();
                }
            }
            items.push(item);
        }
        Ok(items)
    }

    async fn action(
        &self,
        _cancel: CancellationToken,
        item_id: &str,
        action: &str,
    ) -> Result<(), CoreError> {
        let (_, _, name) = parse_item_id(item_id)?;
        match action {
            "start" => self.supervisor.start(name).await,
            "stop" => self.supervisor.stop(name).await,
            "restart" => self.supervisor.restart(name).await,
            other => Err(CoreError::unsupported_action(other, "supervised process")),
        }
    }
}

#[async_trait]
impl LogProvider for SupervisedProvider {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        item_id: &str,
    ) -> Result<broadcast::Receiver<LogLine>, CoreError> {
        let (_, _, name) = parse_item_id(item_id)?;

        {
            let forwards = self.forwards.lock();
            if let Some(forward) = forwards.get(item_id) {
                return Ok(forward.sender.subscribe());
            }
        }

        let mut merged = self.supervisor.log_channel(name)?;
        let (sender, receiver) = broadcast::channel(LOG_CHANNEL_DEPTH);
        let forward_cancel = cancel.child_token();

        let task_sender = sender.clone();
        let task_cancel = forward_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    line = merged.recv() => match line {
                        Some(line) => {
                            // Send fails only with zero receivers; keep
                            // forwarding for late subscribers.
                            let _ = task_sender.send(line);
                        }
                        None => break,
                    },
                }
            }
        });

        self.forwards.lock().insert(
            item_id.to_owned(),
            LogForward {
                sender,
                cancel: forward_cancel,
            },
        );
        Ok(receiver)
    }

    fn unsubscribe(&self, item_id: &str) {
        if let Some(forward) = self.forwards.lock().remove(item_id) {
            forward.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
