//! Presence Tracker
//!
//! Veröffentlicht die Erreichbarkeit des lokalen Endpunkts unter
//! `users/{id}` und beobachtet die anderer Endpunkte. Ein beim Store
//! registrierter Disconnect-Hook setzt `online: false`, auch wenn der
//! Prozess keine Aufräumarbeit mehr ausführen kann.

use crate::endpoint::EndpointId;
use crate::store::{paths, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Failed to write presence: {0}")]
    WriteFailed(StoreError),

    #[error("Failed to read presence: {0}")]
    ReadFailed(StoreError),
}

/// `{ online: bool }` unter `users/{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub online: bool,
}

impl PresenceRecord {
    /// Abwesende oder unlesbare Records gelten als offline
    fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or(Self { online: false })
    }

    fn to_value(self) -> Value {
        serde_json::json!({ "online": self.online })
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn Store>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Setzt `online: true` und registriert `online: false` für den Disconnect
    pub async fn publish_online(&self, local: &EndpointId) -> Result<(), PresenceError> {
        let path = paths::user(local);
        self.store
            .on_disconnect_set(&path, PresenceRecord { online: false }.to_value())
            .await
            .map_err(PresenceError::WriteFailed)?;
        self.store
            .set(&path, PresenceRecord { online: true }.to_value())
            .await
            .map_err(PresenceError::WriteFailed)?;

        tracing::info!("Published presence: {} online", local);
        Ok(())
    }

    /// Expliziter Logout, beliebig oft aufrufbar
    pub async fn publish_offline(&self, local: &EndpointId) -> Result<(), PresenceError> {
        self.store
            .set(&paths::user(local), PresenceRecord { online: false }.to_value())
            .await
            .map_err(PresenceError::WriteFailed)?;

        tracing::info!("Published presence: {} offline", local);
        Ok(())
    }

    /// Einmalige Abfrage
    pub async fn query_online(&self, id: &EndpointId) -> Result<bool, PresenceError> {
        let value = self
            .store
            .get(&paths::user(id))
            .await
            .map_err(PresenceError::ReadFailed)?;
        Ok(PresenceRecord::from_value(value).online)
    }

    /// Beobachtet die Erreichbarkeit von `id`.
    ///
    /// `on_change` wird mit dem aktuellen Wert und danach bei jedem
    /// Wechsel aufgerufen. Die Beobachtung endet mit dem Drop des Handles.
    pub async fn subscribe_online<F>(
        &self,
        id: &EndpointId,
        mut on_change: F,
    ) -> Result<PresenceSubscription, PresenceError>
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut watch = self
            .store
            .watch(&paths::user(id))
            .await
            .map_err(PresenceError::ReadFailed)?;

        let target = id.clone();
        let task = tokio::spawn(async move {
            let mut last: Option<bool> = None;
            while let Some(value) = watch.recv().await {
                let online = PresenceRecord::from_value(value).online;
                if last != Some(online) {
                    tracing::debug!("Presence of {}: {}", target, online);
                    last = Some(online);
                    on_change(online);
                }
            }
        });

        Ok(PresenceSubscription {
            target: id.clone(),
            task,
        })
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker").finish_non_exhaustive()
    }
}

/// Laufende Presence-Beobachtung, Drop beendet sie
#[derive(Debug)]
pub struct PresenceSubscription {
    target: EndpointId,
    task: JoinHandle<()>,
}

impl PresenceSubscription {
    pub fn target(&self) -> &EndpointId {
        &self.target
    }
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================
