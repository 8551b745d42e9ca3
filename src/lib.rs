//! dialtone - Presence und Call-Signaling für P2P Voice Calls
//!
//! Zwei Endpunkte finden sich über einen geteilten Echtzeit-Speicher und
//! bauen eine direkte Audio-Verbindung auf:
//! - Presence (`users/{id}`) mit Disconnect-Hook
//! - Call-Records (`calls/{callId}`) mit Offer und Answer
//! - WebRTC für P2P Audio-Kommunikation
//!
//! `Endpoint` ist der Session-Kontext eines angemeldeten Teilnehmers.

pub mod call;
pub mod config;
pub mod dialpad;
pub mod endpoint;
pub mod media;
pub mod presence;
pub mod signaling;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use call::{CallError, CallHandle, CallMachine};
use config::Config;
use dialpad::DialPad;
use endpoint::EndpointId;
use media::MediaEngine;
use presence::PresenceTracker;
use signaling::SignalingChannel;
use std::sync::Arc;
use store::Store;
use tracing_subscriber::EnvFilter;

/// Initialisiert das Logging (`RUST_LOG` plus Standard-Direktiven).
///
/// Ein zweiter Aufruf ist wirkungslos.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["dialtone=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Session-Kontext eines angemeldeten Endpunkts.
///
/// Entsteht beim Login und lebt bis zum Logout; es gibt keinen globalen
/// Zustand.
pub struct Endpoint {
    local: EndpointId,
    config: Config,
    presence: PresenceTracker,
    calls: CallHandle,
}

impl Endpoint {
    /// Meldet `local` online und startet die Call State Machine
    pub async fn login(
        local: EndpointId,
        store: Arc<dyn Store>,
        media: Arc<dyn MediaEngine>,
        config: Config,
    ) -> Result<Self, CallError> {
        tracing::info!("Logging in as {}", local);

        let presence = PresenceTracker::new(Arc::clone(&store));
        let signaling = SignalingChannel::new(store);

        presence.publish_online(&local).await?;

        let calls = match CallMachine::spawn(
            local.clone(),
            signaling,
            presence.clone(),
            media,
            config.clone(),
        )
        .await
        {
            Ok(calls) => calls,
            Err(e) => {
                if let Err(offline) = presence.publish_offline(&local).await {
                    tracing::warn!("Failed to withdraw presence: {}", offline);
                }
                return Err(e);
            }
        };

        Ok(Self {
            local,
            config,
            presence,
            calls,
        })
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    /// Neues Dial Pad mit Presence-Lookup
    pub fn dial_pad(&self) -> DialPad {
        DialPad::new(self.presence.clone(), &self.config)
    }

    /// Beendet einen laufenden Anruf und meldet offline
    pub async fn logout(self) -> Result<(), CallError> {
        tracing::info!("Logging out {}", self.local);

        match self.calls.shutdown().await {
            Ok(()) | Err(CallError::Stopped) => {}
            Err(e) => return Err(e),
        }
        self.presence.publish_offline(&self.local).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local", &self.local)
            .field("calls", &self.calls)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallEvent, CallPhase, EndReason};
    use crate::store::MemoryStore;
    use crate::testing::FakeMediaEngine;

    async fn login(store: &MemoryStore, raw: &str) -> Endpoint {
        Endpoint::login(
            EndpointId::parse(raw).unwrap(),
            Arc::new(store.client()),
            Arc::new(FakeMediaEngine::new()),
            Config::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_and_logout_publish_presence() {
        let store = MemoryStore::new();
        let observer = PresenceTracker::new(Arc::new(store.client()));
        let alice = login(&store, "+911111111111").await;

        assert!(observer.query_online(alice.local_id()).await.unwrap());

        let id = alice.local_id().clone();
        alice.logout().await.unwrap();
        assert!(!observer.query_online(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_logout_during_call_hangs_up() {
        let store = MemoryStore::new();
        let alice = login(&store, "+911111111111").await;
        let bob = login(&store, "+912222222222").await;
        let mut bob_events = bob.calls().subscribe();

        alice.calls().dial("2222222222").await.unwrap();
        loop {
            if let CallEvent::IncomingCall { .. } = bob_events.recv().await.unwrap() {
                break;
            }
        }
        bob.calls().accept_incoming().await.unwrap();
        bob.calls()
            .watch_state()
            .wait_for(|s| s.phase == CallPhase::Connected)
            .await
            .unwrap();

        alice.logout().await.unwrap();

        loop {
            if let CallEvent::StateChanged(snapshot) = bob_events.recv().await.unwrap() {
                if let CallPhase::Ended(reason) = snapshot.phase {
                    assert_eq!(reason, EndReason::RemoteHangup);
                    break;
                }
            }
        }
        assert_eq!(store.value("calls"), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_dial_pad_sees_logged_in_endpoint() {
        let store = MemoryStore::new();
        let alice = login(&store, "+911111111111").await;
        let _bob = login(&store, "+912222222222").await;

        let mut pad = alice.dial_pad();
        let mut online = pad.remote_online();
        for digit in "2222222222".chars() {
            pad.press(digit).await.unwrap();
        }
        online.wait_for(|v| *v == Some(true)).await.unwrap();
    }
}
