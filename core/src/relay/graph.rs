//! In-memory replicated graph: last-write-wins key/value map with prefix watches

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphEntry {
    pub value: Value,
    /// Writer clock in milliseconds
    pub state: u64,
}

/// Key/value graph shared by a relay server and in-memory relay endpoints.
///
/// Conflicts resolve last-write-wins on `state`; equal states fall back to a
/// lexical comparison of the serialized values so every replica converges.
pub struct GraphStore {
    entries: RwLock<BTreeMap<String, GraphEntry>>,
    updates: broadcast::Sender<(String, Value)>,
}

impl GraphStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            updates,
        }
    }

    /// Apply a write. Returns false when an existing entry wins.
    pub fn put(&self, key: &str, value: Value, state: u64) -> bool {
        {
            let mut entries = self.entries.write();
            if let Some(existing) = entries.get(key) {
                let wins = state > existing.state
                    || (state == existing.state && value.to_string() > existing.value.to_string());
                if !wins {
                    return false;
                }
            }
            entries.insert(
                key.to_string(),
                GraphEntry {
                    value: value.clone(),
                    state,
                },
            );
        }
        // No receivers is fine
        let _ = self.updates.send((key.to_string(), value));
        true
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<GraphEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Live feed of every applied write. Subscribe before scanning so no
    /// write falls between the snapshot and the feed.
    pub fn watch(&self) -> broadcast::Receiver<(String, Value)> {
        self.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}
