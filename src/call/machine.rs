//! Call State Machine
//!
//! Ein Task besitzt die Session und verarbeitet nacheinander:
//! - Befehle vom `CallHandle`
//! - Snapshots der eingehenden Anrufe
//! - Änderungen am eigenen Call-Record
//! - Events der Peer Connection
//! - Klingel- bzw. Verbindungs-Timeout und Sekundentakt
//! - das Ende einer Store-Beobachtung (Verbindung zum Store verloren)
//!
//! Jede Session hat eine Generation. Events einer beendeten Session
//! tragen eine alte Generation und werden verworfen.

use super::state::{CallEvent, CallPhase, CallSnapshot, EndReason};
use super::CallError;
use crate::config::Config;
use crate::endpoint::EndpointId;
use crate::media::{LocalAudio, MediaEngine, PeerConnection, PeerEvent, PeerRole};
use crate::presence::PresenceTracker;
use crate::signaling::{CallId, CallRecord, CallUpdate, SessionDescription, SignalingChannel};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 100;
const TICK: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Dial { digits: String, reply: Reply<CallId> },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    End { reply: Reply<()> },
    SetMuted { muted: bool, reply: Reply<()> },
    SetSpeaker { enabled: bool, reply: Reply<()> },
    Shutdown { reply: Reply<()> },
}

enum Internal {
    Incoming(Vec<(CallId, CallRecord)>),
    Peer { generation: u64, event: PeerEvent },
    Record { generation: u64, update: CallUpdate },
    Timeout { generation: u64 },
    /// Eine Beobachtung wurde vom Store beendet; `None` ist die der
    /// eingehenden Anrufe
    StoreLost { generation: Option<u64> },
}

/// Die eine aktive Session eines Endpunkts
struct Session {
    generation: u64,
    role: PeerRole,
    call_id: CallId,
    remote: EndpointId,
    /// Offer der Gegenseite (nur als Angerufener)
    remote_offer: Option<SessionDescription>,
    audio: Option<Arc<dyn LocalAudio>>,
    peer: Option<Box<dyn PeerConnection>>,
    /// Der Record liegt (noch) im Store und muss beim Ende gelöscht werden
    record_exists: bool,
    answered: bool,
    /// Eigenes Answer geschrieben (nur als Angerufener)
    answer_published: bool,
    connected_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn elapsed_seconds(&self) -> u64 {
        self.connected_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Zugriff der Oberfläche auf die Call State Machine
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Ruft eine Nummer an.
    ///
    /// Kehrt zurück sobald die Gegenseite als online bestätigt und die
    /// lokale Peer Connection erzeugt ist; das Offer folgt asynchron.
    pub async fn dial(&self, digits: &str) -> Result<CallId, CallError> {
        let digits = digits.to_string();
        self.request(|reply| Command::Dial { digits, reply }).await
    }

    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Legt auf; ohne aktiven Anruf ein No-op
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply })
            .await
    }

    pub async fn set_speaker(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetSpeaker { enabled, reply })
            .await
    }

    /// Beendet einen laufenden Anruf und stoppt die Machine
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn state(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

// ============================================================================
// MACHINE
// ============================================================================

pub struct CallMachine {
    local: EndpointId,
    config: Config,
    signaling: SignalingChannel,
    presence: PresenceTracker,
    media: Arc<dyn MediaEngine>,

    phase: CallPhase,
    session: Option<Session>,
    generation: u64,
    muted: bool,
    speaker: bool,

    /// Letzter Snapshot der klingelnden Records an uns
    incoming: Vec<(CallId, CallRecord)>,
    /// Bereits behandelte oder verworfene Anrufe
    dismissed: HashSet<CallId>,
    incoming_task: Option<JoinHandle<()>>,
    store_lost: bool,

    internal_tx: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallMachine {
    /// Abonniert die eingehenden Anrufe und startet den Task
    pub async fn spawn(
        local: EndpointId,
        signaling: SignalingChannel,
        presence: PresenceTracker,
        media: Arc<dyn MediaEngine>,
        config: Config,
    ) -> Result<CallHandle, CallError> {
        let mut incoming = signaling.subscribe_incoming(&local).await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSnapshot::idle());
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let incoming_tx = internal_tx.clone();
        let incoming_task = tokio::spawn(async move {
            while let Some(calls) = incoming.next().await {
                if incoming_tx.send(Internal::Incoming(calls)).is_err() {
                    return;
                }
            }
            let _ = incoming_tx.send(Internal::StoreLost { generation: None });
        });

        let machine = Self {
            local,
            config,
            signaling,
            presence,
            media,
            phase: CallPhase::Idle,
            session: None,
            generation: 0,
            muted: false,
            speaker: false,
            incoming: Vec::new(),
            dismissed: HashSet::new(),
            incoming_task: Some(incoming_task),
            store_lost: false,
            internal_tx,
            state_tx,
            event_tx: event_tx.clone(),
        };
        tokio::spawn(machine.run(command_rx, internal_rx));

        Ok(CallHandle {
            commands: command_tx,
            state: state_rx,
            events: event_tx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::info!("Call machine started for {}", self.local);

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.teardown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(event) = internal.recv() => self.handle_internal(event).await,
                _ = ticker.tick() => self.tick(),
            }

            if self.session.is_none() {
                self.offer_next_incoming().await;
            }
        }

        tracing::info!("Call machine stopped for {}", self.local);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Dial { digits, reply } => {
                let result = self.dial(&digits).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            Command::Reject { reply } => {
                let result = self.reject().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.end_call().await;
                let _ = reply.send(Ok(()));
            }
            Command::SetMuted { muted, reply } => {
                self.muted = muted;
                if let Some(audio) = self.session.as_ref().and_then(|s| s.audio.as_ref()) {
                    audio.set_muted(muted);
                }
                self.publish_state();
                let _ = reply.send(Ok(()));
            }
            Command::SetSpeaker { enabled, reply } => {
                self.speaker = enabled;
                if let Some(audio) = self.session.as_ref().and_then(|s| s.audio.as_ref()) {
                    audio.set_speaker(enabled);
                }
                self.publish_state();
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    async fn dial(&mut self, digits: &str) -> Result<CallId, CallError> {
        if self.session.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let target = EndpointId::from_dialed(
            digits,
            &self.config.country_prefix,
            self.config.number_length,
        )?;
        if target == self.local {
            return Err(CallError::InvalidEndpoint(format!(
                "{} is the local endpoint",
                target
            )));
        }

        let online = match self.presence.query_online(&target).await {
            Ok(online) => online,
            Err(e) => {
                tracing::warn!("Presence query for {} failed, treating as offline: {}", target, e);
                false
            }
        };
        if !online {
            tracing::info!("Not dialing {}: offline", target);
            return Err(CallError::PeerUnreachable(target));
        }

        let call_id = CallId::generate();
        tracing::info!("Dialing {} (call {})", target, call_id);

        self.begin(PeerRole::Initiator, call_id.clone(), target, None);
        self.set_phase(CallPhase::Dialing);

        if let Err(e) = self.start_media(PeerRole::Initiator).await {
            self.finish(EndReason::Failed(e.clone())).await;
            return Err(e);
        }

        Ok(call_id)
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        if self.phase != CallPhase::IncomingOffered {
            return Err(CallError::NoIncomingCall);
        }
        let Some(offer) = self.session.as_ref().and_then(|s| s.remote_offer.clone()) else {
            return Err(CallError::NoIncomingCall);
        };

        tracing::info!("Accepting incoming call");
        self.set_phase(CallPhase::Connecting);
        self.start_timer();

        if let Err(e) = self.start_media(PeerRole::Responder).await {
            self.finish(EndReason::Failed(e.clone())).await;
            return Err(e);
        }

        // Das Answer kommt als LocalSignal zurück
        if let Err(e) = self.signal_peer(offer).await {
            self.finish(EndReason::Failed(e.clone())).await;
            return Err(e);
        }

        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        if self.phase != CallPhase::IncomingOffered {
            return Err(CallError::NoIncomingCall);
        }
        tracing::info!("Rejecting incoming call");
        self.finish(EndReason::Declined).await;
        Ok(())
    }

    async fn end_call(&mut self) {
        if self.session.is_none() {
            tracing::debug!("No active call to end");
        } else if self.phase == CallPhase::IncomingOffered {
            self.finish(EndReason::Declined).await;
        } else {
            self.finish(EndReason::LocalHangup).await;
        }
    }

    async fn teardown(&mut self) {
        self.end_call().await;
        if let Some(task) = self.incoming_task.take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Internal events
    // ------------------------------------------------------------------------

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Incoming(calls) => {
                self.dismissed
                    .retain(|id| calls.iter().any(|(call_id, _)| call_id == id));
                self.incoming = calls;
                self.resolve_glare().await;
            }
            Internal::Peer { generation, event } if self.is_current(generation) => {
                self.handle_peer_event(event).await
            }
            Internal::Record { generation, update } if self.is_current(generation) => {
                self.handle_record_update(update).await
            }
            Internal::Timeout { generation } if self.is_current(generation) => {
                self.handle_timeout().await
            }
            Internal::StoreLost { generation } => self.handle_store_lost(generation).await,
            _ => tracing::debug!("Discarding event of a finished session"),
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalSignal(description) => self.handle_local_signal(description).await,
            PeerEvent::RemoteStream => {
                if self.phase != CallPhase::Connecting {
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.connected_at = Some(Instant::now());
                    if let Some(timer) = session.timer.take() {
                        timer.abort();
                    }
                }
                tracing::info!("Call connected");
                self.set_phase(CallPhase::Connected);
            }
            PeerEvent::Error(reason) => {
                self.fail(CallError::PeerConnectionError(reason)).await;
            }
        }
    }

    async fn handle_local_signal(&mut self, description: SessionDescription) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let role = session.role;
        let call_id = session.call_id.clone();
        let remote = session.remote.clone();

        match (role, self.phase.clone()) {
            (PeerRole::Initiator, CallPhase::Dialing) => {
                if let Err(e) = self
                    .signaling
                    .publish_offer(&call_id, &self.local, &remote, description)
                    .await
                {
                    self.fail(e.into()).await;
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.record_exists = true;
                }
                if let Err(e) = self.watch_record().await {
                    self.fail(e).await;
                    return;
                }
                self.start_timer();
                tracing::info!("Ringing {} (call {})", remote, call_id);
                self.set_phase(CallPhase::Ringing);
            }
            (PeerRole::Responder, CallPhase::Connecting) => {
                match self.signaling.publish_answer(&call_id, description).await {
                    Ok(true) => {
                        tracing::info!("Answer published for call {}", call_id);
                        if let Some(session) = self.session.as_mut() {
                            session.answer_published = true;
                        }
                    }
                    Ok(false) => self.finish(EndReason::Cancelled).await,
                    Err(e) => self.fail(e.into()).await,
                }
            }
            (_, phase) => tracing::debug!("Ignoring local signal in {:?}", phase),
        }
    }

    async fn handle_record_update(&mut self, update: CallUpdate) {
        match update {
            CallUpdate::Removed => {
                // Ein eigenes Answer kann den Record danach als Fragment
                // neu angelegt haben; dann wird trotzdem gelöscht
                if let Some(session) = self.session.as_mut() {
                    session.record_exists = session.answer_published;
                }
                let reason = match self.phase {
                    CallPhase::IncomingOffered => EndReason::Cancelled,
                    CallPhase::Dialing | CallPhase::Ringing => EndReason::Rejected,
                    _ => EndReason::RemoteHangup,
                };
                tracing::info!("Call record removed by remote");
                self.finish(reason).await;
            }
            CallUpdate::Updated(record) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.role != PeerRole::Initiator || session.answered {
                    return;
                }
                let Some(answer) = record.answer else {
                    return;
                };
                session.answered = true;

                tracing::info!("Answer received for call {}", session.call_id);
                self.set_phase(CallPhase::Connecting);
                self.start_timer();

                if let Err(e) = self.signal_peer(answer).await {
                    self.fail(e).await;
                }
            }
        }
    }

    /// `Ringing` endet mit `NoAnswer`, `Connecting` ohne Remote-Stream
    /// als Verbindungsfehler
    async fn handle_timeout(&mut self) {
        let window = self.config.ring_window();
        match self.phase {
            CallPhase::Ringing => {
                tracing::info!("No answer within {:?}", window);
                self.report(CallError::NoAnswer);
                self.finish(EndReason::NoAnswer).await;
            }
            CallPhase::Connecting => {
                self.fail(CallError::PeerConnectionError(format!(
                    "no remote media within {:?}",
                    window
                )))
                .await;
            }
            _ => {}
        }
    }

    /// Ohne Store sieht die Session weder Auflegen noch neue Anrufe.
    /// Gemeldet wird der Verlust einmal.
    async fn handle_store_lost(&mut self, generation: Option<u64>) {
        match generation {
            None => {
                self.incoming_task = None;
                self.incoming.clear();
            }
            Some(generation) if !self.is_current(generation) => return,
            Some(_) => {}
        }

        let error = CallError::SignalingReadFailed("connection to store lost".to_string());
        if let Some(session) = self.session.as_mut() {
            session.record_exists = false;
        }

        if self.store_lost {
            if self.session.is_some() {
                self.finish(EndReason::Failed(error)).await;
            }
            return;
        }
        self.store_lost = true;

        if self.session.is_some() {
            self.fail(error).await;
        } else {
            self.report(error);
        }
    }

    fn tick(&mut self) {
        if self.phase == CallPhase::Connected {
            self.publish_state();
        }
    }

    // ------------------------------------------------------------------------
    // Incoming offers
    // ------------------------------------------------------------------------

    /// Nächster klingelnder, nicht verwaister Record (älteste zuerst)
    fn next_candidate(&mut self, from: Option<&EndpointId>) -> Option<(CallId, CallRecord)> {
        let now = chrono::Utc::now().timestamp_millis();
        let max_age = self.config.offer_max_age();

        let mut found = None;
        for (call_id, record) in &self.incoming {
            if self.dismissed.contains(call_id) {
                continue;
            }
            if record.is_stale(now, max_age) {
                tracing::debug!("Ignoring stale offer {} from {}", call_id, record.from);
                self.dismissed.insert(call_id.clone());
                continue;
            }
            if from.map(|f| f == &record.from).unwrap_or(true) {
                found = Some((call_id.clone(), record.clone()));
                break;
            }
        }
        found
    }

    async fn offer_next_incoming(&mut self) {
        if let Some((call_id, record)) = self.next_candidate(None) {
            self.present_incoming(call_id, record).await;
        }
    }

    /// Gleichzeitige Anrufe in beide Richtungen: die größere Kennung gibt
    /// ihr eigenes Offer auf und nimmt das eingehende an
    async fn resolve_glare(&mut self) {
        let remote = match &self.session {
            Some(session)
                if session.role == PeerRole::Initiator
                    && matches!(self.phase, CallPhase::Dialing | CallPhase::Ringing) =>
            {
                session.remote.clone()
            }
            _ => return,
        };

        let Some((call_id, record)) = self.next_candidate(Some(&remote)) else {
            return;
        };

        if self.local < remote {
            tracing::info!("Glare with {}: keeping own offer", remote);
            self.dismissed.insert(call_id);
            return;
        }

        tracing::info!("Glare with {}: taking over call {}", remote, call_id);
        self.finish(EndReason::Superseded).await;
        self.present_incoming(call_id, record).await;
    }

    async fn present_incoming(&mut self, call_id: CallId, record: CallRecord) {
        let Some(offer) = record.offer.clone() else {
            return;
        };

        tracing::info!("Incoming call {} from {}", call_id, record.from);
        self.begin(
            PeerRole::Responder,
            call_id.clone(),
            record.from.clone(),
            Some(offer),
        );

        if let Err(e) = self.watch_record().await {
            self.fail(e).await;
            return;
        }

        self.set_phase(CallPhase::IncomingOffered);
        let _ = self.event_tx.send(CallEvent::IncomingCall {
            call_id,
            from: record.from,
        });
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    fn begin(
        &mut self,
        role: PeerRole,
        call_id: CallId,
        remote: EndpointId,
        remote_offer: Option<SessionDescription>,
    ) {
        self.generation += 1;
        self.session = Some(Session {
            generation: self.generation,
            role,
            call_id,
            remote,
            remote_offer,
            audio: None,
            peer: None,
            // Der Record eines eingehenden Anrufs existiert bereits
            record_exists: role == PeerRole::Responder,
            answered: false,
            answer_published: false,
            connected_at: None,
            timer: None,
            tasks: Vec::new(),
        });
    }

    /// Öffnet das Mikrofon und erzeugt die Peer Connection
    async fn start_media(&mut self, role: PeerRole) -> Result<(), CallError> {
        let generation = self.generation;

        let audio = self.media.create_local_audio_stream().await?;
        audio.set_muted(self.muted);
        audio.set_speaker(self.speaker);

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let internal = self.internal_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                if internal.send(Internal::Peer { generation, event }).is_err() {
                    break;
                }
            }
        });

        if let Some(session) = self.session.as_mut() {
            session.audio = Some(Arc::clone(&audio));
            session.tasks.push(forward);
        }

        let peer = self
            .media
            .create_peer_connection(role, &self.config.ice_servers, audio, peer_tx)
            .await?;

        match self.session.as_mut() {
            Some(session) => session.peer = Some(peer),
            None => peer.close().await,
        }
        Ok(())
    }

    async fn signal_peer(&self, remote: SessionDescription) -> Result<(), CallError> {
        match self.session.as_ref().and_then(|s| s.peer.as_ref()) {
            Some(peer) => Ok(peer.signal(remote).await?),
            None => Err(CallError::PeerConnectionError(
                "no peer connection".to_string(),
            )),
        }
    }

    async fn watch_record(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let generation = session.generation;
        let mut watch = self.signaling.watch_call(&session.call_id).await?;

        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(update) = watch.next().await {
                if internal.send(Internal::Record { generation, update }).is_err() {
                    return;
                }
            }
            let _ = internal.send(Internal::StoreLost {
                generation: Some(generation),
            });
        });

        if let Some(session) = self.session.as_mut() {
            session.tasks.push(task);
        }
        Ok(())
    }

    /// Startet das Zeitfenster der aktuellen Phase neu
    fn start_timer(&mut self) {
        let generation = self.generation;
        let window = self.config.ring_window();
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = internal.send(Internal::Timeout { generation });
        });

        match self.session.as_mut() {
            Some(session) => {
                if let Some(old) = session.timer.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
    }

    async fn fail(&mut self, error: CallError) {
        self.report(error.clone());
        self.finish(EndReason::Failed(error)).await;
    }

    fn report(&self, error: CallError) {
        tracing::error!("Call failed: {}", error);
        let _ = self.event_tx.send(CallEvent::Failed(error));
    }

    /// Gibt alle Ressourcen der Session frei, meldet `Ended` und danach `Idle`
    async fn finish(&mut self, reason: EndReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        for task in session.tasks.drain(..).chain(session.timer.take()) {
            task.abort();
        }
        let peer = session.peer.take();
        let audio = session.audio.take();
        let call_id = session.call_id.clone();
        let clear = session.record_exists
            && (session.answer_published
                || !matches!(
                    reason,
                    EndReason::RemoteHangup | EndReason::Rejected | EndReason::Cancelled
                ));

        if let Some(peer) = peer {
            peer.close().await;
        }
        if let Some(audio) = audio {
            audio.stop();
        }
        if clear {
            if let Err(e) = self.signaling.clear(&call_id).await {
                self.report(e.into());
            }
        }
        self.dismissed.insert(call_id.clone());

        tracing::info!("Call {} ended: {:?}", call_id, reason);
        self.set_phase(CallPhase::Ended(reason));

        self.session = None;
        self.muted = false;
        self.speaker = false;
        self.set_phase(CallPhase::Idle);
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn set_phase(&mut self, phase: CallPhase) {
        self.phase = phase;
        self.publish_state();
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase.clone(),
            remote_id: self.session.as_ref().map(|s| s.remote.clone()),
            call_id: self.session.as_ref().map(|s| s.call_id.clone()),
            elapsed_seconds: self
                .session
                .as_ref()
                .map(Session::elapsed_seconds)
                .unwrap_or(0),
            muted: self.muted,
            speaker: self.speaker,
        }
    }

    fn publish_state(&self) {
        let snapshot = self.snapshot();
        if *self.state_tx.borrow() == snapshot {
            return;
        }
        tracing::debug!("Call state: {:?}", snapshot.phase);
        self.state_tx.send_replace(snapshot.clone());
        let _ = self.event_tx.send(CallEvent::StateChanged(snapshot));
    }
}

// ============================================================================
// TESTS
// ============================================================================
