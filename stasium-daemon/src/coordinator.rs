//! The daemon composition root: wires the manifest store, supervisor,
//! providers, item table, and transport server, and registers the protocol
//! handlers. No business logic lives here beyond the wiring.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use stasium_core::{parse_item_id, Item, LogProvider, Provider};
use stasium_manifest::Manifest;
use stasium_transport::{
    event, method, ActionRequest, GetItemRequest, LoadManifestRequest, LogsSubscribeRequest,
    Message, Server, UpdateManifestRequest, UpdateManifestResponse,
};

use crate::error::DaemonError;
use crate::poll::PollLoop;
use crate::store::{ManifestStore, ReloadAction};
use crate::supervisor::Supervisor;

/// Deadline for a provider action triggered by a client request.
const ACTION_DEADLINE: Duration = Duration::from_secs(10);

/// Shared state behind every protocol handler and the poll loop.
pub(crate) struct DaemonState {
    pub(crate) server: Arc<Server>,
    pub(crate) store: ManifestStore,
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) providers: Vec<Arc<dyn Provider>>,
    pub(crate) log_providers: HashMap<&'static str, Arc<dyn LogProvider>>,
    pub(crate) items: RwLock<HashMap<String, Item>>,
    pub(crate) log_forwards: Mutex<HashMap<String, CancellationToken>>,
    pub(crate) cancel: CancellationToken,
}

/// The stasiumd daemon.
pub struct Daemon {
    state: Arc<DaemonState>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Wire up the daemon. `providers` are polled in the given registration
    /// order; `log_providers` are dispatched by item kind.
    pub fn new(
        socket_path: &Path,
        cancel: CancellationToken,
        supervisor: Arc<Supervisor>,
        providers: Vec<Arc<dyn Provider>>,
        log_providers: HashMap<&'static str, Arc<dyn LogProvider>>,
    ) -> Self {
        let server = Arc::new(Server::new(socket_path));
        let state = Arc::new(DaemonState {
            server,
            store: ManifestStore::new(),
            supervisor,
            providers,
            log_providers,
            items: RwLock::new(HashMap::new()),
            log_forwards: Mutex::new(HashMap::new()),
            cancel: cancel.clone(),
        });
        register_handlers(&state);
        Self { state, cancel }
    }

    /// Install an already-validated manifest (bootstrap path).
    pub async fn install_manifest(&self, manifest: Manifest) {
        self.state.store.install(manifest).await;
    }

    /// The poll loop bound to this daemon's state.
    pub fn poll_loop(&self, interval: Duration) -> PollLoop {
        PollLoop::new(Arc::clone(&self.state), interval)
    }

    /// Serve the socket until the daemon's token is cancelled.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.state.server.start(self.cancel.clone()).await?;
        Ok(())
    }

    /// Close the server socket, drop clients, and remove the socket file.
    pub fn shutdown(&self) {
        self.state.server.close();
    }

    /// The transport server (for event broadcasting).
    pub fn server(&self) -> Arc<Server> {
        Arc::clone(&self.state.server)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn register_handlers(state: &Arc<DaemonState>) {
    let server = Arc::clone(&state.server);

    server.handle(method::PING, |_msg| {
        Box::pin(async { Ok(json!({ "pong": true })) })
    });

    let s = Arc::clone(state);
    server.handle(method::LIST_ITEMS, move |_msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_list_items(s).await })
    });

    let s = Arc::clone(state);
    server.handle(method::GET_ITEM, move |msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_get_item(s, msg).await })
    });

    let s = Arc::clone(state);
    server.handle(method::ACTION, move |msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_action(s, msg).await })
    });

    let s = Arc::clone(state);
    server.handle(method::LOAD_MANIFEST, move |msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_load_manifest(s, msg).await })
    });

    let s = Arc::clone(state);
    server.handle(method::UPDATE_MANIFEST, move |msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_update_manifest(s, msg).await })
    });

    let s = Arc::clone(state);
    server.handle(method::LOGS_SUBSCRIBE, move |msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_logs_subscribe(s, msg).await })
    });

    let s = Arc::clone(state);
    server.handle(method::LOGS_UNSUBSCRIBE, move |msg| {
        let s = Arc::clone(&s);
        Box::pin(async move { handle_logs_unsubscribe(s, msg).await })
    });
}

fn decode<T: serde::de::DeserializeOwned>(msg: &Message) -> Result<T, String> {
    let data = msg.data.clone().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|err| format!("invalid request: {err}"))
}

async fn handle_list_items(state: Arc<DaemonState>) -> Result<Value, String> {
    let items = state.items.read().await;
    let list: Vec<&Item> = items.values().collect();
    serde_json::to_value(&list).map_err(|err| err.to_string())
}

async fn handle_get_item(state: Arc<DaemonState>, msg: Message) -> Result<Value, String> {
    let req: GetItemRequest = decode(&msg)?;
    let items = state.items.read().await;
    match items.get(&req.id) {
        Some(item) => serde_json::to_value(item).map_err(|err| err.to_string()),
        None => Err(format!("item not found: {}", req.id)),
    }
}

async fn handle_action(state: Arc<DaemonState>, msg: Message) -> Result<Value, String> {
    let req: ActionRequest = decode(&msg)?;
    let (kind, _, _) = parse_item_id(&req.item_id).map_err(|err| err.to_string())?;

    let provider = state
        .providers
        .iter()
        .find(|provider| provider.name() == kind.as_str())
        .ok_or_else(|| format!("no provider for kind {:?}", kind.as_str()))?;

    let action = tokio::time::timeout(
        ACTION_DEADLINE,
        provider.action(state.cancel.child_token(), &req.item_id, &req.action),
    )
    .await
    .map_err(|_| format!("action {:?} timed out", req.action))?;

    action.map_err(|err| err.to_string())?;
    Ok(json!({ "ok": true }))
}

async fn handle_load_manifest(state: Arc<DaemonState>, msg: Message) -> Result<Value, String> {
    let req: LoadManifestRequest = decode(&msg)?;
    let response = match state.store.load(Path::new(&req.path)).await {
        Ok(()) => UpdateManifestResponse::ok(),
        Err(errors) => UpdateManifestResponse::failed(errors),
    };
    serde_json::to_value(&response).map_err(|err| err.to_string())
}

async fn handle_update_manifest(state: Arc<DaemonState>, msg: Message) -> Result<Value, String> {
    let req: UpdateManifestRequest = decode(&msg)?;

    let (response, actions) = if !req.remove_item.is_empty() {
        state.store.remove_item(&req.remove_item).await
    } else if let Some(patch) = req.add_item {
        state.store.add_item(&patch.name, patch.item).await
    } else if let Some(patch) = req.update_item {
        state.store.update_item(&patch.name, patch.item).await
    } else {
        (
            UpdateManifestResponse::failed(vec!["no operation specified".to_owned()]),
            Vec::new(),
        )
    };

    // Persisted first; supervisor side effects only after commit.
    apply_reload(&state, actions).await;
    serde_json::to_value(&response).map_err(|err| err.to_string())
}

async fn apply_reload(state: &DaemonState, actions: Vec<ReloadAction>) {
    for action in actions {
        match action {
            ReloadAction::Start { name, item } | ReloadAction::Refresh { name, item } => {
                state.supervisor.register(
                    &name,
                    &item.command,
                    &item.dir,
                    item.env.clone(),
                    item.restart_policy(),
                );
                if let Err(err) = state.supervisor.start(&name).await {
                    tracing::error!(name = %name, error = %err, "start after manifest change");
                }
            }
            ReloadAction::Replace { name, item } => {
                state.supervisor.unregister(&name).await;
                state.supervisor.register(
                    &name,
                    &item.command,
                    &item.dir,
                    item.env.clone(),
                    item.restart_policy(),
                );
                if let Err(err) = state.supervisor.start(&name).await {
                    tracing::error!(name = %name, error = %err, "start after manifest change");
                }
            }
            ReloadAction::Remove { name } => {
                state.supervisor.unregister(&name).await;
            }
        }
    }
}

async fn handle_logs_subscribe(state: Arc<DaemonState>, msg: Message) -> Result<Value, String> {
    let req: LogsSubscribeRequest = decode(&msg)?;
    let (kind, _, _) = parse_item_id(&req.item_id).map_err(|err| err.to_string())?;

    let provider = state
        .log_providers
        .get(kind.as_str())
        .cloned()
        .ok_or_else(|| format!("no log provider for kind {:?}", kind.as_str()))?;

    let mut forwards = state.log_forwards.lock().await;
    if forwards.contains_key(&req.item_id) {
        return Ok(json!({ "ok": true }));
    }

    let mut receiver = provider
        .subscribe(state.cancel.child_token(), &req.item_id)
        .await
        .map_err(|err| err.to_string())?;

    let forward_cancel = state.cancel.child_token();
    forwards.insert(req.item_id.clone(), forward_cancel.clone());
    drop(forwards);

    let server = Arc::clone(&state.server);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = forward_cancel.cancelled() => break,
                line = receiver.recv() => match line {
                    Ok(line) => {
                        if let Ok(payload) = serde_json::to_value(&line) {
                            server.broadcast(&Message::event(event::LOGS_LINE, Some(payload))).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "log forwarder lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    Ok(json!({ "ok": true }))
}

async fn handle_logs_unsubscribe(state: Arc<DaemonState>, msg: Message) -> Result<Value, String> {
    let req: LogsSubscribeRequest = decode(&msg)?;
    let (kind, _, _) = parse_item_id(&req.item_id).map_err(|err| err.to_string())?;

    if let Some(forward) = state.log_forwards.lock().await.remove(&req.item_id) {
        forward.cancel();
    }
    if let Some(provider) = state.log_providers.get(kind.as_str()) {
        provider.unsubscribe(&req.item_id);
    }
    Ok(json!({ "ok": true }))
}
