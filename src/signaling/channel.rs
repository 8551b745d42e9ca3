//! Signaling Channel - Publish/Subscribe über Call-Records

use super::record::{CallId, CallRecord, SessionDescription};
use super::SignalingError;
use crate::endpoint::EndpointId;
use crate::store::{paths, Store, Watch};
use serde_json::Value;
use std::sync::Arc;

/// Änderung eines einzelnen Call-Records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallUpdate {
    Updated(CallRecord),
    Removed,
}

/// Zugriff auf die Call-Records im Store
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn Store>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Legt den Record an bzw. überschreibt ihn
    pub async fn publish_offer(
        &self,
        call_id: &CallId,
        from: &EndpointId,
        to: &EndpointId,
        offer: SessionDescription,
    ) -> Result<CallRecord, SignalingError> {
        let record = CallRecord {
            from: from.clone(),
            to: to.clone(),
            offer: Some(offer),
            answer: None,
            created_at: Some(chrono::Utc::now().timestamp_millis()),
        };
        let value = serde_json::to_value(&record).map_err(|e| SignalingError::Malformed {
            call_id: call_id.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Publishing offer {} ({} -> {})", call_id, from, to);
        self.store
            .set(&paths::call(call_id), value)
            .await
            .map_err(SignalingError::WriteFailed)?;
        Ok(record)
    }

    /// Setzt das Answer.
    ///
    /// Gibt `false` zurück und schreibt nichts, wenn der Record fehlt, noch
    /// kein Offer hat oder bereits beantwortet ist. Prüfen und Schreiben sind
    /// zwei Store-Operationen, der Store bietet keine Transaktion.
    ///
    /// Verschwindet der Record zwischen Prüfen und Schreiben, legt das
    /// Schreiben einen Record nur mit Answer an. Dieses Fragment wird wieder
    /// gelöscht und das Ergebnis ist `false`.
    pub async fn publish_answer(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<bool, SignalingError> {
        let Some(record) = self.get(call_id).await? else {
            tracing::warn!("Ignoring answer for missing call {}", call_id);
            return Ok(false);
        };
        if record.offer.is_none() || record.answer.is_some() {
            tracing::warn!("Ignoring answer for call {} (offer missing or already answered)", call_id);
            return Ok(false);
        }

        let value = serde_json::to_value(&answer).map_err(|e| SignalingError::Malformed {
            call_id: call_id.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Publishing answer {}", call_id);
        self.store
            .set(&paths::call_answer(call_id), value)
            .await
            .map_err(SignalingError::WriteFailed)?;

        let written = self
            .store
            .get(&paths::call(call_id))
            .await
            .map_err(SignalingError::ReadFailed)?;
        if !written.is_null() && written.get("offer").map_or(true, Value::is_null) {
            tracing::warn!("Call {} vanished before its answer, removing fragment", call_id);
            self.clear(call_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Liest einen Record
    pub async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>, SignalingError> {
        let value = self
            .store
            .get(&paths::call(call_id))
            .await
            .map_err(SignalingError::ReadFailed)?;
        parse_record(call_id, value)
    }

    /// Löscht den Record (Auflegen oder Ablehnen)
    pub async fn clear(&self, call_id: &CallId) -> Result<(), SignalingError> {
        tracing::debug!("Clearing call {}", call_id);
        self.store
            .remove(&paths::call(call_id))
            .await
            .map_err(SignalingError::WriteFailed)
    }

    /// Beobachtet alle klingelnden Records für `local`
    pub async fn subscribe_incoming(
        &self,
        local: &EndpointId,
    ) -> Result<IncomingCalls, SignalingError> {
        let watch = self
            .store
            .watch(paths::CALLS)
            .await
            .map_err(SignalingError::ReadFailed)?;
        Ok(IncomingCalls {
            local: local.clone(),
            watch,
        })
    }

    /// Beobachtet einen einzelnen Record
    pub async fn watch_call(&self, call_id: &CallId) -> Result<CallWatch, SignalingError> {
        let watch = self
            .store
            .watch(&paths::call(call_id))
            .await
            .map_err(SignalingError::ReadFailed)?;
        Ok(CallWatch {
            call_id: call_id.clone(),
            watch,
        })
    }

    /// Wartet auf das Answer eines Records
    pub async fn subscribe_answer(&self, call_id: &CallId) -> Result<AnswerWatch, SignalingError> {
        Ok(AnswerWatch {
            inner: self.watch_call(call_id).await?,
        })
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel").finish_non_exhaustive()
    }
}

fn parse_record(call_id: &CallId, value: Value) -> Result<Option<CallRecord>, SignalingError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| SignalingError::Malformed {
            call_id: call_id.to_string(),
            reason: e.to_string(),
        })
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Snapshot-Strom der eingehenden Anrufe
#[derive(Debug)]
pub struct IncomingCalls {
    local: EndpointId,
    watch: Watch,
}

impl IncomingCalls {
    /// Nächster Snapshot: alle unbeantworteten Records an `local`,
    /// älteste zuerst. Wird bei jeder Änderung der Sammlung geliefert.
    pub async fn next(&mut self) -> Option<Vec<(CallId, CallRecord)>> {
        let snapshot = self.watch.recv().await?;
        Some(filter_incoming(&self.local, snapshot))
    }
}

fn filter_incoming(local: &EndpointId, snapshot: Value) -> Vec<(CallId, CallRecord)> {
    let Value::Object(calls) = snapshot else {
        return Vec::new();
    };

    let mut ringing: Vec<(CallId, CallRecord)> = calls
        .into_iter()
        .filter_map(|(key, value)| {
            let call_id = CallId::from(key.as_str());
            match parse_record(&call_id, value) {
                Ok(Some(record)) if record.is_ringing_for(local) => Some((call_id, record)),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!("Skipping call record: {}", e);
                    None
                }
            }
        })
        .collect();

    ringing.sort_by(|(a_id, a), (b_id, b)| {
        a.created_at
            .unwrap_or(i64::MAX)
            .cmp(&b.created_at.unwrap_or(i64::MAX))
            .then_with(|| a_id.cmp(b_id))
    });
    ringing
}

/// Änderungen eines einzelnen Records
#[derive(Debug)]
pub struct CallWatch {
    call_id: CallId,
    watch: Watch,
}

impl CallWatch {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Nächste Änderung; unlesbare Records werden übersprungen
    pub async fn next(&mut self) -> Option<CallUpdate> {
        loop {
            let value = self.watch.recv().await?;
            match parse_record(&self.call_id, value) {
                Ok(Some(record)) => return Some(CallUpdate::Updated(record)),
                Ok(None) => return Some(CallUpdate::Removed),
                Err(e) => tracing::warn!("{}", e),
            }
        }
    }
}

/// Liefert genau einmal das Answer eines Records
#[derive(Debug)]
pub struct AnswerWatch {
    inner: CallWatch,
}

impl AnswerWatch {
    /// `None` wenn der Record vorher verschwindet
    pub async fn answer(mut self) -> Option<SessionDescription> {
        loop {
            match self.inner.next().await? {
                CallUpdate::Updated(CallRecord {
                    answer: Some(answer),
                    ..
                }) => return Some(answer),
                CallUpdate::Updated(_) => continue,
                CallUpdate::Removed => return None,
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryClient, MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Löscht den gelesenen Record direkt nach dem ersten `get`, so als
    /// hätte der Anrufer zwischen Prüfen und Schreiben aufgelegt
    struct HangupAfterRead {
        inner: MemoryClient,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Store for HangupAfterRead {
        async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
            self.inner.set(path, value).await
        }

        async fn get(&self, path: &str) -> Result<Value, StoreError> {
            let value = self.inner.get(path).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.remove(path).await?;
            }
            Ok(value)
        }

        async fn remove(&self, path: &str) -> Result<(), StoreError> {
            self.inner.remove(path).await
        }

        async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
            self.inner.watch(path).await
        }

        async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<(), StoreError> {
            self.inner.on_disconnect_set(path, value).await
        }
    }

    fn id(raw: &str) -> EndpointId {
        EndpointId::parse(raw).unwrap()
    }

    fn channel(store: &MemoryStore) -> SignalingChannel {
        SignalingChannel::new(Arc::new(store.client()))
    }

    #[tokio::test]
    async fn test_second_answer_is_ignored() {
        let store = MemoryStore::new();
        let signaling = channel(&store);
        let call_id = CallId::generate();

        signaling
            .publish_offer(
                &call_id,
                &id("+911111111111"),
                &id("+912222222222"),
                SessionDescription::offer("offer"),
            )
            .await
            .unwrap();

        assert!(signaling
            .publish_answer(&call_id, SessionDescription::answer("first"))
            .await
            .unwrap());
        let before = signaling.get(&call_id).await.unwrap();

        assert!(!signaling
            .publish_answer(&call_id, SessionDescription::answer("second"))
            .await
            .unwrap());
        let after = signaling.get(&call_id).await.unwrap();

        assert_eq!(before, after);
        assert_eq!(after.unwrap().answer.unwrap().sdp, "first");
    }

    #[tokio::test]
    async fn test_answer_after_hangup_leaves_no_fragment() {
        let store = MemoryStore::new();
        let caller = channel(&store);
        let call_id = CallId::from("c1");
        caller
            .publish_offer(
                &call_id,
                &id("+911111111111"),
                &id("+912222222222"),
                SessionDescription::offer("offer"),
            )
            .await
            .unwrap();

        let callee = SignalingChannel::new(Arc::new(HangupAfterRead {
            inner: store.client(),
            armed: AtomicBool::new(true),
        }));

        let published = callee
            .publish_answer(&call_id, SessionDescription::answer("late"))
            .await
            .unwrap();

        assert!(!published);
        assert_eq!(store.value("calls"), Value::Null);
    }

    #[tokio::test]
    async fn test_store_failures_keep_direction() {
        let store = MemoryStore::new();
        let signaling = channel(&store);
        let call_id = CallId::generate();
        store.set_unavailable(Some("maintenance"));

        assert!(matches!(
            signaling.clear(&call_id).await,
            Err(SignalingError::WriteFailed(_))
        ));
        assert!(matches!(
            signaling.get(&call_id).await,
            Err(SignalingError::ReadFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_answer_without_record_is_ignored() {
        let store = MemoryStore::new();
        let signaling = channel(&store);
        let call_id = CallId::generate();

        assert!(!signaling
            .publish_answer(&call_id, SessionDescription::answer("late"))
            .await
            .unwrap());
        assert_eq!(signaling.get(&call_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incoming_filters_by_callee_and_answer() {
        let store = MemoryStore::new();
        let alice = channel(&store);
        let bob = channel(&store);
        let a = id("+911111111111");
        let b = id("+912222222222");
        let c = id("+913333333333");

        // Vor dem Abonnieren vorhanden: kommt im ersten Snapshot
        let to_bob = CallId::from("call-to-bob");
        alice
            .publish_offer(&to_bob, &a, &b, SessionDescription::offer("o1"))
            .await
            .unwrap();
        let to_carol = CallId::from("call-to-carol");
        alice
            .publish_offer(&to_carol, &a, &c, SessionDescription::offer("o2"))
            .await
            .unwrap();

        let mut incoming = bob.subscribe_incoming(&b).await.unwrap();
        let first = incoming.next().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, to_bob);

        // Alice sieht ihren eigenen Record nicht als eingehend
        let mut own = alice.subscribe_incoming(&a).await.unwrap();
        assert!(own.next().await.unwrap().is_empty());

        bob.publish_answer(&to_bob, SessionDescription::answer("r1"))
            .await
            .unwrap();
        assert!(incoming.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_answer_fires_once_answer_appears() {
        let store = MemoryStore::new();
        let alice = channel(&store);
        let bob = channel(&store);
        let call_id = CallId::generate();

        alice
            .publish_offer(
                &call_id,
                &id("+911111111111"),
                &id("+912222222222"),
                SessionDescription::offer("offer"),
            )
            .await
            .unwrap();

        let watch = alice.subscribe_answer(&call_id).await.unwrap();
        let waiter = tokio::spawn(watch.answer());

        bob.publish_answer(&call_id, SessionDescription::answer("answer"))
            .await
            .unwrap();

        assert_eq!(
            waiter.await.unwrap(),
            Some(SessionDescription::answer("answer"))
        );
    }

    #[tokio::test]
    async fn test_clear_is_seen_as_removal() {
        let store = MemoryStore::new();
        let alice = channel(&store);
        let call_id = CallId::generate();

        alice
            .publish_offer(
                &call_id,
                &id("+911111111111"),
                &id("+912222222222"),
                SessionDescription::offer("offer"),
            )
            .await
            .unwrap();

        let mut watch = alice.watch_call(&call_id).await.unwrap();
        assert!(matches!(watch.next().await, Some(CallUpdate::Updated(_))));

        alice.clear(&call_id).await.unwrap();
        assert_eq!(watch.next().await, Some(CallUpdate::Removed));
        assert_eq!(store.value("calls"), Value::Null);
    }

    #[test]
    fn test_filter_orders_oldest_first() {
        let me = id("+912222222222");
        let snapshot = serde_json::json!({
            "b": { "from": "+911", "to": "+912222222222", "offer": { "type": "offer", "sdp": "x" }, "createdAt": 20 },
            "a": { "from": "+913", "to": "+912222222222", "offer": { "type": "offer", "sdp": "y" }, "createdAt": 30 },
            "c": { "garbage": true }
        });

        let ringing = filter_incoming(&me, snapshot);
        let ids: Vec<&str> = ringing.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
