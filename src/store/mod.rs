//! Store Module - geteilter Key/Value-Broadcast-Speicher
//!
//! Abstraktion über den Echtzeit-Speicher, über den Presence und
//! Call-Signaling laufen:
//! - `set` / `get` / `remove` auf Pfaden (`users/{id}`, `calls/{callId}`)
//! - `watch` liefert zuerst den aktuellen Wert, danach jede Änderung
//! - `on_disconnect_set` registriert einen serverseitigen Schreibvorgang,
//!   der ausgeführt wird sobald die Verbindung des Clients abbricht
//!
//! Abwesende Werte werden als `Value::Null` dargestellt.

mod memory;
mod protocol;
mod remote;

pub use memory::{MemoryClient, MemoryStore};
pub use protocol::{ClientMessage, ServerMessage};
pub use remote::{RemoteStore, RemoteStoreEvent};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Not connected to store")]
    NotConnected,

    #[error("Invalid store path: {0}")]
    InvalidPath(String),

    #[error("Store rejected request: {code} - {message}")]
    Rejected { code: i32, message: String },

    #[error("Request timed out")]
    Timeout,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Vertrag des Echtzeit-Speichers
#[async_trait]
pub trait Store: Send + Sync {
    /// Schreibt `value` unter `path` (last-writer-wins). `Null` löscht.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Einmaliges Lesen. Abwesend = `Null`.
    async fn get(&self, path: &str) -> Result<Value, StoreError>;

    /// Löscht `path` samt Unterbaum
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Beobachtet `path` inklusive Unterbaum
    async fn watch(&self, path: &str) -> Result<Watch, StoreError>;

    /// Registriert einen Schreibvorgang für den Verbindungsabbruch
    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<(), StoreError>;
}

// ============================================================================
// WATCH
// ============================================================================

/// Laufende Beobachtung eines Pfads. Drop meldet sie beim Store ab.
pub struct Watch {
    rx: mpsc::UnboundedReceiver<Value>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Watch {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Value>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Nächster Wert; `None` wenn der Store die Beobachtung beendet hat
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch").finish_non_exhaustive()
    }
}

// ============================================================================
// PATHS
// ============================================================================

pub mod paths {
    use crate::endpoint::EndpointId;
    use crate::signaling::CallId;

    pub const USERS: &str = "users";
    pub const CALLS: &str = "calls";

    pub fn user(id: &EndpointId) -> String {
        format!("{}/{}", USERS, id)
    }

    pub fn call(id: &CallId) -> String {
        format!("{}/{}", CALLS, id)
    }

    pub fn call_answer(id: &CallId) -> String {
        format!("{}/{}/answer", CALLS, id)
    }
}

/// Zerlegt einen Pfad in Segmente und prüft die Zeichen
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>, StoreError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    for segment in &segments {
        if segment
            .chars()
            .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']') || c.is_control())
        {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
    }
    Ok(segments)
}
