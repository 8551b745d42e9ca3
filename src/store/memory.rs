//! In-Memory Store
//!
//! Vollständige Implementierung des Store-Vertrags im Prozess.
//! Mehrere `MemoryClient` teilen sich einen `MemoryStore`, so wie mehrere
//! Endpunkte sich eine Echtzeit-Datenbank teilen. `disconnect` simuliert
//! einen Verbindungsabbruch und führt die registrierten Hooks aus.

use super::{split_path, Store, StoreError, Watch};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct Watcher {
    id: u64,
    client_id: u64,
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Value>,
}

struct DisconnectHook {
    client_id: u64,
    path: Vec<String>,
    value: Value,
}

struct Shared {
    root: Value,
    watchers: Vec<Watcher>,
    hooks: Vec<DisconnectHook>,
    next_id: u64,
    unavailable: Option<String>,
}

impl Shared {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Schreibt und benachrichtigt alle betroffenen Watcher
    fn write(&mut self, path: &[String], value: Value) {
        let affected: Vec<(usize, Value)> = self
            .watchers
            .iter()
            .enumerate()
            .filter(|(_, w)| overlaps(&w.path, path))
            .map(|(i, w)| (i, value_at(&self.root, &w.path)))
            .collect();

        if value.is_null() {
            remove_at(&mut self.root, path);
        } else {
            set_at(&mut self.root, path, value);
        }

        for (i, before) in affected {
            let watcher = &self.watchers[i];
            let after = value_at(&self.root, &watcher.path);
            if after != before {
                let _ = watcher.tx.send(after);
            }
        }
        self.watchers.retain(|w| !w.tx.is_closed());
    }
}

/// Gemeinsamer Speicher, entspricht der Server-Seite
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                root: Value::Object(Map::new()),
                watchers: Vec::new(),
                hooks: Vec::new(),
                next_id: 0,
                unavailable: None,
            })),
        }
    }

    /// Erstellt einen neuen verbundenen Client
    pub fn client(&self) -> MemoryClient {
        let id = self.shared.lock().next_id();
        MemoryClient {
            id,
            shared: Arc::clone(&self.shared),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Liest einen Wert direkt (ohne Client)
    pub fn value(&self, path: &str) -> Value {
        let segments = match split_path(path) {
            Ok(s) => owned(&s),
            Err(_) => return Value::Null,
        };
        value_at(&self.shared.lock().root, &segments)
    }

    /// Simuliert einen Verbindungsabbruch des Clients.
    ///
    /// Alle Disconnect-Hooks des Clients werden ausgeführt, seine Watches
    /// beendet und weitere Aufrufe schlagen mit `NotConnected` fehl.
    pub fn disconnect(&self, client: &MemoryClient) {
        if !client.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut shared = self.shared.lock();
        let hooks: Vec<DisconnectHook> = {
            let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut shared.hooks)
                .into_iter()
                .partition(|h| h.client_id == client.id);
            shared.hooks = others;
            mine
        };

        shared.watchers.retain(|w| w.client_id != client.id);

        for hook in hooks {
            tracing::debug!("Running disconnect hook for {}", hook.path.join("/"));
            shared.write(&hook.path, hook.value);
        }
    }

    /// Simuliert einen Ausfall: alle Operationen schlagen fehl
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.shared.lock().unavailable = reason.map(str::to_string);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("MemoryStore")
            .field("watchers", &shared.watchers.len())
            .field("hooks", &shared.hooks.len())
            .finish()
    }
}

/// Verbindung eines einzelnen Endpunkts zum `MemoryStore`
#[derive(Clone)]
pub struct MemoryClient {
    id: u64,
    shared: Arc<Mutex<Shared>>,
    connected: Arc<AtomicBool>,
}

impl MemoryClient {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check(&self, shared: &Shared) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::NotConnected);
        }
        if let Some(reason) = &shared.unavailable {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryClient {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segments = owned(&split_path(path)?);
        let mut shared = self.shared.lock();
        self.check(&shared)?;
        shared.write(&segments, value);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        let segments = owned(&split_path(path)?);
        let shared = self.shared.lock();
        self.check(&shared)?;
        Ok(value_at(&shared.root, &segments))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.set(path, Value::Null).await
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        let segments = owned(&split_path(path)?);
        let mut shared = self.shared.lock();
        self.check(&shared)?;

        let (tx, rx) = mpsc::unbounded_channel();
        // Erster Wert ist der aktuelle Snapshot
        let _ = tx.send(value_at(&shared.root, &segments));

        let id = shared.next_id();
        shared.watchers.push(Watcher {
            id,
            client_id: self.id,
            path: segments,
            tx,
        });

        let weak: Weak<Mutex<Shared>> = Arc::downgrade(&self.shared);
        Ok(Watch::new(rx, move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().watchers.retain(|w| w.id != id);
            }
        }))
    }

    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segments = owned(&split_path(path)?);
        let mut shared = self.shared.lock();
        self.check(&shared)?;
        // Ein Hook pro Pfad und Client, der neueste gewinnt
        let client_id = self.id;
        shared
            .hooks
            .retain(|h| !(h.client_id == client_id && h.path == segments));
        shared.hooks.push(DisconnectHook {
            client_id,
            path: segments,
            value,
        });
        Ok(())
    }
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// TREE HELPERS
// ============================================================================

fn owned(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

/// Ein Pfad ist vom Schreiben betroffen wenn einer Prefix des anderen ist
fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn value_at(root: &Value, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn set_at(node: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.clone()).or_insert(Value::Null);
        set_at(child, rest, value);
    }
}

/// Entfernt den Knoten und räumt leer gewordene Eltern auf
fn remove_at(node: &mut Value, path: &[String]) -> bool {
    let Some((first, rest)) = path.split_first() else {
        return false;
    };
    let Value::Object(map) = node else {
        return false;
    };
    if rest.is_empty() {
        map.remove(first);
    } else if let Some(child) = map.get_mut(first) {
        if remove_at(child, rest) {
            map.remove(first);
        }
    }
    map.is_empty()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_nested() {
        let store = MemoryStore::new();
        let client = store.client();

        client
            .set("calls/c1", json!({ "from": "+911", "to": "+912" }))
            .await
            .unwrap();
        client
            .set("calls/c1/answer", json!({ "type": "answer", "sdp": "x" }))
            .await
            .unwrap();

        let record = client.get("calls/c1").await.unwrap();
        assert_eq!(record["from"], "+911");
        assert_eq!(record["answer"]["sdp"], "x");
        assert_eq!(client.get("calls/missing").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_remove_prunes_empty_parents() {
        let store = MemoryStore::new();
        let client = store.client();

        client.set("calls/c1/offer", json!("o")).await.unwrap();
        client.remove("calls/c1").await.unwrap();

        assert_eq!(store.value("calls"), Value::Null);
    }

    #[tokio::test]
    async fn test_watch_delivers_snapshot_then_changes() {
        let store = MemoryStore::new();
        let a = store.client();
        let b = store.client();

        a.set("calls/c1/offer", json!("o1")).await.unwrap();

        let mut watch = b.watch("calls").await.unwrap();
        assert_eq!(watch.recv().await.unwrap()["c1"]["offer"], "o1");

        a.set("calls/c1/answer", json!("r1")).await.unwrap();
        assert_eq!(watch.recv().await.unwrap()["c1"]["answer"], "r1");

        // Schreibvorgänge außerhalb des Pfads lösen nichts aus
        a.set("users/+911", json!({ "online": true })).await.unwrap();
        a.remove("calls/c1").await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_unchanged_write_is_not_delivered() {
        let store = MemoryStore::new();
        let client = store.client();
        client.set("users/+911", json!({ "online": true })).await.unwrap();

        let mut watch = client.watch("users/+911").await.unwrap();
        assert_eq!(watch.recv().await.unwrap()["online"], true);

        client.set("users/+911", json!({ "online": true })).await.unwrap();
        client.set("users/+911", json!({ "online": false })).await.unwrap();
        assert_eq!(watch.recv().await.unwrap()["online"], false);
    }

    #[tokio::test]
    async fn test_disconnect_runs_hooks() {
        let store = MemoryStore::new();
        let a = store.client();
        let b = store.client();

        a.set("users/+911", json!({ "online": true })).await.unwrap();
        a.on_disconnect_set("users/+911", json!({ "online": false }))
            .await
            .unwrap();

        let mut watch = b.watch("users/+911").await.unwrap();
        assert_eq!(watch.recv().await.unwrap()["online"], true);

        store.disconnect(&a);

        assert_eq!(watch.recv().await.unwrap()["online"], false);
        assert_eq!(
            a.set("users/+911", json!({ "online": true })).await,
            Err(StoreError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_dropped_watch_is_unregistered() {
        let store = MemoryStore::new();
        let client = store.client();

        let watch = client.watch("calls").await.unwrap();
        drop(watch);

        assert_eq!(store.shared.lock().watchers.len(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        let client = store.client();
        store.set_unavailable(Some("maintenance"));

        assert!(matches!(
            client.get("users/+911").await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(None);
        assert!(client.get("users/+911").await.is_ok());
    }
}
