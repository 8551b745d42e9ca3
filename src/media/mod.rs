//! Media Module - Grenze zur Media Engine
//!
//! Die Call State Machine kennt nur diese Schnittstellen:
//! - `MediaEngine`: lokaler Audio-Stream und Peer Connections
//! - `PeerConnection`: nimmt Remote-Signale entgegen, wird geschlossen
//! - `PeerEvent`: lokale Signale, Remote-Stream und Fehler als Events
//!
//! `WebRtcEngine` ist die Implementierung über `webrtc` und `cpal`.

mod audio;
mod rtc;

pub use self::audio::{AudioError, AudioHandler, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use self::rtc::WebRtcEngine;

use crate::config::IceServerConfig;
use crate::signaling::SessionDescription;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone unavailable: {0}")]
    AcquisitionFailed(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

impl From<AudioError> for MediaError {
    fn from(e: AudioError) -> Self {
        MediaError::AcquisitionFailed(e.to_string())
    }
}

// ============================================================================
// PEER CONNECTION CONTRACT
// ============================================================================

/// Rolle beim Verbindungsaufbau
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Erzeugt das Offer
    Initiator,
    /// Beantwortet ein Offer
    Responder,
}

/// Events einer Peer Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Lokal erzeugtes Offer bzw. Answer
    LocalSignal(SessionDescription),
    /// Erster Remote-Audio-Stream ist da
    RemoteStream,
    /// Fehler oder Verbindungsabbruch
    Error(String),
}

/// Lokaler Mikrofon-Stream, geteilt von höchstens einer Session
pub trait LocalAudio: Send + Sync {
    fn set_muted(&self, muted: bool);
    fn is_muted(&self) -> bool;
    fn set_speaker(&self, enabled: bool);
    /// Gibt das Gerät frei
    fn stop(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Übergibt das Signal der Gegenseite (Offer oder Answer)
    async fn signal(&self, remote: SessionDescription) -> Result<(), MediaError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_local_audio_stream(&self) -> Result<Arc<dyn LocalAudio>, MediaError>;

    /// Erzeugt eine Peer Connection. Events gehen an `events`.
    ///
    /// Als `Initiator` liefert die Verbindung von sich aus ein
    /// `LocalSignal` mit dem Offer, als `Responder` erst nach `signal`.
    async fn create_peer_connection(
        &self,
        role: PeerRole,
        ice_servers: &[IceServerConfig],
        local: Arc<dyn LocalAudio>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, MediaError>;
}
