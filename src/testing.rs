//! Skriptbare Media Engine für Tests ohne Audio-Hardware

use crate::config::IceServerConfig;
use crate::media::{LocalAudio, MediaEngine, MediaError, PeerConnection, PeerEvent, PeerRole};
use crate::signaling::{SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    fail_audio: bool,
    hold_offers: bool,
    held_offer: Option<Arc<FakePeerState>>,
    silent: bool,
    audio: Vec<Arc<FakeAudio>>,
    peers: Vec<Arc<FakePeerState>>,
}

/// Initiator meldet sofort ein Offer, Responder nach `signal` ein Answer
/// und danach den Remote-Stream. Der Initiator meldet den Remote-Stream,
/// sobald er das Answer bekommt.
#[derive(Clone, Default)]
pub(crate) struct FakeMediaEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mikrofonzugriff verweigern
    pub fn fail_audio(&self, fail: bool) {
        self.state.lock().fail_audio = fail;
    }

    /// Offers zurückhalten, bis `release_offer` sie freigibt
    pub fn hold_offers(&self, hold: bool) {
        self.state.lock().hold_offers = hold;
    }

    pub fn release_offer(&self) {
        if let Some(peer) = self.state.lock().held_offer.take() {
            peer.send_offer();
        }
    }

    /// Verbindungen melden nie einen Remote-Stream
    pub fn silent_peers(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Anzahl geöffneter und nicht gestoppter Audio-Streams
    pub fn live_audio(&self) -> usize {
        self.state
            .lock()
            .audio
            .iter()
            .filter(|a| !a.stopped.load(Ordering::SeqCst))
            .count()
    }

    /// (muted, speaker) des zuletzt geöffneten Streams
    pub fn last_audio_state(&self) -> Option<(bool, bool)> {
        self.state
            .lock()
            .audio
            .last()
            .map(|a| (a.is_muted(), a.speaker.load(Ordering::SeqCst)))
    }

    /// Anzahl offener Peer Connections
    pub fn open_peers(&self) -> usize {
        self.state
            .lock()
            .peers
            .iter()
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Simuliert einen Verbindungsfehler der zuletzt erzeugten Verbindung
    pub fn fail_last_peer(&self, reason: &str) {
        if let Some(peer) = self.state.lock().peers.last() {
            let _ = peer.events.send(PeerEvent::Error(reason.to_string()));
        }
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create_local_audio_stream(&self) -> Result<Arc<dyn LocalAudio>, MediaError> {
        let mut state = self.state.lock();
        if state.fail_audio {
            return Err(MediaError::AcquisitionFailed("permission denied".to_string()));
        }
        let audio = Arc::new(FakeAudio::default());
        state.audio.push(Arc::clone(&audio));
        Ok(audio)
    }

    async fn create_peer_connection(
        &self,
        role: PeerRole,
        _ice_servers: &[IceServerConfig],
        _local: Arc<dyn LocalAudio>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, MediaError> {
        let mut state = self.state.lock();
        let peer = Arc::new(FakePeerState {
            role,
            index: state.peers.len(),
            events,
            silent: state.silent,
            closed: AtomicBool::new(false),
        });
        state.peers.push(Arc::clone(&peer));

        if role == PeerRole::Initiator {
            if state.hold_offers {
                state.held_offer = Some(Arc::clone(&peer));
            } else {
                peer.send_offer();
            }
        }

        Ok(Box::new(FakePeer(peer)))
    }
}

struct FakePeerState {
    role: PeerRole,
    index: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    silent: bool,
    closed: AtomicBool,
}

impl FakePeerState {
    fn send_offer(&self) {
        let offer = SessionDescription::offer(format!("fake-offer-{}", self.index));
        let _ = self.events.send(PeerEvent::LocalSignal(offer));
    }

    fn send_stream(&self) {
        if !self.silent {
            let _ = self.events.send(PeerEvent::RemoteStream);
        }
    }
}

struct FakePeer(Arc<FakePeerState>);

#[async_trait]
impl PeerConnection for FakePeer {
    async fn signal(&self, remote: SessionDescription) -> Result<(), MediaError> {
        let peer = &self.0;
        match (peer.role, remote.kind) {
            (PeerRole::Responder, SdpKind::Offer) => {
                let answer = SessionDescription::answer(format!("fake-answer-{}", peer.index));
                let _ = peer.events.send(PeerEvent::LocalSignal(answer));
                peer.send_stream();
                Ok(())
            }
            (PeerRole::Initiator, SdpKind::Answer) => {
                peer.send_stream();
                Ok(())
            }
            (role, kind) => Err(MediaError::InvalidSdp(format!("{:?} got {:?}", role, kind))),
        }
    }

    async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeAudio {
    muted: AtomicBool,
    speaker: AtomicBool,
    stopped: AtomicBool,
}

impl LocalAudio for FakeAudio {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn set_speaker(&self, enabled: bool) {
        self.speaker.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
