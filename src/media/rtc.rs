//! WebRTC Media Engine
//!
//! Peer Connections über `webrtc` mit nicht-trickle ICE: Offer und Answer
//! werden erst gemeldet, wenn das ICE-Gathering abgeschlossen ist, und
//! enthalten damit alle Kandidaten.

use super::audio::{AudioHandler, SAMPLE_RATE};
use super::{LocalAudio, MediaEngine, MediaError, PeerConnection, PeerEvent, PeerRole};
use crate::config::IceServerConfig;
use crate::signaling::{SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

fn rtc_err(e: impl std::fmt::Display) -> MediaError {
    MediaError::WebRTC(e.to_string())
}

/// Media Engine über `webrtc` und `cpal`
#[derive(Debug, Default, Clone)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }

    fn ice_servers(config: &[IceServerConfig]) -> Vec<RTCIceServer> {
        config
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }

    /// Erstellt eine neue Peer Connection mit Opus-fähiger Media Engine
    async fn build_peer_connection(
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: Self::ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(rtc_err)?;
        Ok(Arc::new(pc))
    }

    /// Registriert die Handler, die in `PeerEvent`s übersetzt werden
    fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &mpsc::UnboundedSender<PeerEvent>) {
        // Remote-Medien werden genau einmal gemeldet: erster Track oder Connected
        let stream_reported = Arc::new(AtomicBool::new(false));

        let state_events = events.clone();
        let state_reported = Arc::clone(&stream_reported);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            match s {
                RTCPeerConnectionState::Connected => {
                    if !state_reported.swap(true, Ordering::SeqCst) {
                        let _ = state_events.send(PeerEvent::RemoteStream);
                    }
                }
                s if is_fatal(s) => {
                    let _ = state_events.send(PeerEvent::Error(format!("peer connection {}", s)));
                }
                RTCPeerConnectionState::Disconnected => {
                    tracing::warn!("Peer connection interrupted, waiting for ICE to recover");
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _, _| {
            if !stream_reported.swap(true, Ordering::SeqCst) {
                let _ = track_events.send(PeerEvent::RemoteStream);
            }
            Box::pin(async move {
                tracing::info!("Received track: {:?}", track.codec());
            })
        }));
    }

    /// Fügt den lokalen Opus-Audio-Track hinzu
    async fn add_audio_track(pc: &Arc<RTCPeerConnection>) -> Result<(), MediaError> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "dialtone".to_string(),
        ));

        // TODO: Capture-Frames Opus-kodiert in den Track schreiben, sobald ein Opus-Encoder im Stack ist
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;
        Ok(())
    }

    /// Setzt die lokale Description und wartet auf das ICE-Gathering
    async fn finish_local_description(
        pc: &Arc<RTCPeerConnection>,
        description: RTCSessionDescription,
        kind: SdpKind,
    ) -> Result<SessionDescription, MediaError> {
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(description)
            .await
            .map_err(rtc_err)?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| MediaError::WebRTC("no local description".to_string()))?;

        Ok(SessionDescription {
            kind,
            sdp: local.sdp,
        })
    }
}

/// `Disconnected` kann sich erholen; erst `Failed` beendet die Verbindung
fn is_fatal(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
    )
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_local_audio_stream(&self) -> Result<Arc<dyn LocalAudio>, MediaError> {
        // cpal blockiert beim Öffnen der Geräte
        let handler = tokio::task::spawn_blocking(AudioHandler::open)
            .await
            .map_err(|e| MediaError::AcquisitionFailed(e.to_string()))??;
        Ok(Arc::new(handler))
    }

    async fn create_peer_connection(
        &self,
        role: PeerRole,
        ice_servers: &[IceServerConfig],
        local: Arc<dyn LocalAudio>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, MediaError> {
        let pc = Self::build_peer_connection(ice_servers).await?;
        Self::install_handlers(&pc, &events);
        Self::add_audio_track(&pc).await?;

        if role == PeerRole::Initiator {
            let offer_pc = Arc::clone(&pc);
            let offer_events = events.clone();
            tokio::spawn(async move {
                let result = match offer_pc.create_offer(None).await {
                    Ok(offer) => {
                        Self::finish_local_description(&offer_pc, offer, SdpKind::Offer).await
                    }
                    Err(e) => Err(rtc_err(e)),
                };
                let event = match result {
                    Ok(offer) => PeerEvent::LocalSignal(offer),
                    Err(e) => PeerEvent::Error(e.to_string()),
                };
                let _ = offer_events.send(event);
            });
        }

        Ok(Box::new(RtcPeer {
            pc,
            role,
            events,
            _local: local,
        }))
    }
}

/// Peer Connection einer Session
struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    role: PeerRole,
    events: mpsc::UnboundedSender<PeerEvent>,
    _local: Arc<dyn LocalAudio>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn signal(&self, remote: SessionDescription) -> Result<(), MediaError> {
        match (self.role, remote.kind) {
            (PeerRole::Responder, SdpKind::Offer) => {
                let offer = RTCSessionDescription::offer(remote.sdp)
                    .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
                self.pc.set_remote_description(offer).await.map_err(rtc_err)?;

                let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
                let answer =
                    WebRtcEngine::finish_local_description(&self.pc, answer, SdpKind::Answer)
                        .await?;
                let _ = self.events.send(PeerEvent::LocalSignal(answer));
                Ok(())
            }
            (PeerRole::Initiator, SdpKind::Answer) => {
                let answer = RTCSessionDescription::answer(remote.sdp)
                    .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(rtc_err)
            }
            (role, kind) => Err(MediaError::InvalidSdp(format!(
                "{:?} cannot accept remote {:?}",
                role, kind
            ))),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}
