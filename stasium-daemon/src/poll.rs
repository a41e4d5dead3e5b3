//! Periodic provider reconciliation: merge, score, swap, diff, broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use stasium_core::Item;
use stasium_manifest::{Manifest, Rule};
use stasium_transport::{event, Message};

use crate::coordinator::DaemonState;

/// Per-provider deadline for a single `list` call.
pub const LIST_DEADLINE: Duration = Duration::from_secs(2);

/// Default cadence between reconciliation ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Changes to the item table over one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

impl Delta {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

/// Refreshes all providers on a fixed cadence and emits delta events.
pub struct PollLoop {
    state: Arc<DaemonState>,
    interval: Duration,
}

impl PollLoop {
    pub(crate) fn new(state: Arc<DaemonState>, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Run until cancelled. Ticks never overlap; the delta for cycle N is
    /// broadcast before cycle N+1 begins.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(&cancel).await,
            }
        }
    }

    pub(crate) async fn tick(&self, cancel: &CancellationToken) {
        let mut new_items: HashMap<String, Item> = HashMap::new();

        // Registration order; duplicate ids resolve last-writer-wins.
        for provider in &self.state.providers {
            let listed =
                tokio::time::timeout(LIST_DEADLINE, provider.list(cancel.child_token())).await;
            match listed {
                Ok(Ok(items)) => {
                    for item in items {
                        new_items.insert(item.id.clone(), item);
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(provider = provider.name(), error = %err, "provider list error");
                }
                Err(_) => {
                    tracing::warn!(provider = provider.name(), "provider list timed out");
                }
            }
        }

        let manifest = self.state.store.manifest().await;
        for item in new_items.values_mut() {
            item.score = compute_score(item, manifest.as_ref());
        }

        let delta = {
            let mut items = self.state.items.write().await;
            let old_items = std::mem::replace(&mut *items, new_items);
            compute_delta(&old_items, &items)
        };

        if delta.has_changes() {
            match serde_json::to_value(&delta) {
                Ok(payload) => {
                    let evt = Message::event(event::ITEMS_DELTA, Some(payload));
                    self.state.server.broadcast(&evt).await;
                }
                Err(err) => tracing::error!(error = %err, "delta encode error"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Delta computation
// ---------------------------------------------------------------------------

/// Two observations of one item compare equal iff their
/// {status, cpu_pct, mem_bytes, score} quadruples match.
fn item_changed(a: &Item, b: &Item) -> bool {
    a.status != b.status
        || a.cpu_pct != b.cpu_pct
        || a.mem_bytes != b.mem_bytes
        || a.score != b.score
}

pub fn compute_delta(old: &HashMap<String, Item>, new: &HashMap<String, Item>) -> Delta {
    let mut delta = Delta::default();

    for (id, item) in new {
        match old.get(id) {
            None => delta.added.push(item.clone()),
            Some(previous) if item_changed(previous, item) => delta.updated.push(item.clone()),
            Some(_) => {}
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            delta.removed.push(id.clone());
        }
    }

    delta
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

const MANIFEST_KIND_BONUS: i64 = 60;
const HIGH_CPU_BONUS: i64 = 10;
const HIGH_MEM_BONUS: i64 = 5;
const HIGH_CPU_PCT: f64 = 5.0;
const HIGH_MEM_BYTES: u64 = 100 * 1024 * 1024;

/// Deterministic relevance score for an item given the current manifest.
/// Rules sum, so their order never affects the result.
pub fn compute_score(item: &Item, manifest: Option<&Manifest>) -> i64 {
    let mut score = 0;

    if let Some(manifest) = manifest {
        if manifest
            .items
            .values()
            .any(|mi| mi.kind == item.kind.as_str())
        {
            score += MANIFEST_KIND_BONUS;
        }
        for rule in &manifest.rules {
            if matches_rule(item, rule) {
                score += rule.score;
            }
        }
    }

    if item.cpu_pct > HIGH_CPU_PCT {
        score += HIGH_CPU_BONUS;
    }
    if item.mem_bytes > HIGH_MEM_BYTES {
        score += HIGH_MEM_BONUS;
    }

    score
}

/// All specified keys must match; keys other than `kind` and `group` are
/// ignored.
fn matches_rule(item: &Item, rule: &Rule) -> bool {
    for (key, value) in &rule.match_on {
        match key.as_str() {
            "kind" => {
                if item.kind.as_str() != value {
                    return false;
                }
            }
            "group" => {
                if item.group != *value {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
