//! Message Types für das Store-Relay-Protokoll
//!
//! JSON über WebSocket. Jede Client-Anfrage trägt eine `requestId`,
//! der Server bestätigt mit `ack`, `value` oder `error`. Watch-Events
//! werden über die `watchId` zugeordnet.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Wert schreiben (`null` löscht)
    Set {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
        value: Value,
    },

    /// Wert einmalig lesen
    Get {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
    },

    /// Pfad beobachten
    Watch {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "watchId")]
        watch_id: u64,
        path: String,
    },

    /// Beobachtung beenden
    Unwatch {
        #[serde(rename = "watchId")]
        watch_id: u64,
    },

    /// Schreibvorgang bei Verbindungsabbruch registrieren
    OnDisconnectSet {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
        value: Value,
    },

    /// Heartbeat
    Ping,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Anfrage erfolgreich
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
    },

    /// Antwort auf `get`
    Value {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(default)]
        value: Value,
    },

    /// Neuer Wert eines beobachteten Pfads
    Event {
        #[serde(rename = "watchId")]
        watch_id: u64,
        #[serde(default)]
        value: Value,
    },

    /// Fehler (optional einer Anfrage zugeordnet)
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<u64>,
        code: i32,
        message: String,
    },

    /// Heartbeat Antwort
    Pong,
}
