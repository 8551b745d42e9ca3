//! Datentypen eines Call-Records

use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kennung eines Anrufversuchs (zufälliges Token)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Neues zufälliges Token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opakes Session-Description-Payload der Media Engine.
///
/// Enthält bei nicht-trickle ICE bereits alle gesammelten Kandidaten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Signaling-Umschlag eines Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub from: EndpointId,
    pub to: EndpointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Erstellungszeit in ms seit Epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl CallRecord {
    /// Eingehender, noch klingelnder Anruf für `local`
    pub fn is_ringing_for(&self, local: &EndpointId) -> bool {
        &self.to == local && self.offer.is_some() && self.answer.is_none()
    }

    /// Records ohne Zeitstempel gelten nie als verwaist
    pub fn is_stale(&self, now_ms: i64, max_age: Duration) -> bool {
        match self.created_at {
            Some(created) => now_ms.saturating_sub(created) > max_age.as_millis() as i64,
            None => false,
        }
    }
}
