//! Dial Pad Modell
//!
//! Sammelt gewählte Ziffern und beobachtet die Erreichbarkeit der
//! Zielnummer, sobald sie vollständig ist. Ändert sich die Nummer, wird
//! die alte Beobachtung freigegeben.

use crate::config::Config;
use crate::endpoint::{EndpointError, EndpointId};
use crate::presence::{PresenceError, PresenceSubscription, PresenceTracker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialPadError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

pub struct DialPad {
    presence: PresenceTracker,
    country_prefix: String,
    number_length: usize,
    digits: String,
    subscription: Option<PresenceSubscription>,
    /// Zählt Beobachtungen hoch, damit eine alte nicht mehr schreibt
    lookup: Arc<AtomicU64>,
    online_tx: Arc<watch::Sender<Option<bool>>>,
}

impl DialPad {
    pub fn new(presence: PresenceTracker, config: &Config) -> Self {
        let (online_tx, _) = watch::channel(None);
        Self {
            presence,
            country_prefix: config.country_prefix.clone(),
            number_length: config.number_length,
            digits: String::new(),
            subscription: None,
            lookup: Arc::new(AtomicU64::new(0)),
            online_tx: Arc::new(online_tx),
        }
    }

    /// Hängt eine Ziffer an
    pub async fn press(&mut self, digit: char) -> Result<(), DialPadError> {
        if !digit.is_ascii_digit() {
            return Err(EndpointError::InvalidCharacter(digit).into());
        }
        self.digits.push(digit);
        self.refresh().await
    }

    pub async fn backspace(&mut self) -> Result<(), DialPadError> {
        self.digits.pop();
        self.refresh().await
    }

    pub async fn clear(&mut self) -> Result<(), DialPadError> {
        self.digits.clear();
        self.refresh().await
    }

    pub fn number(&self) -> &str {
        &self.digits
    }

    /// Zielnummer, sobald sie vollständig ist
    pub fn target(&self) -> Option<EndpointId> {
        if self.digits.len() != self.number_length {
            return None;
        }
        EndpointId::from_dialed(&self.digits, &self.country_prefix, self.number_length).ok()
    }

    /// `None` solange die Nummer unvollständig oder noch nicht nachgeschlagen ist
    pub fn remote_online(&self) -> watch::Receiver<Option<bool>> {
        self.online_tx.subscribe()
    }

    async fn refresh(&mut self) -> Result<(), DialPadError> {
        let Some(target) = self.target() else {
            if let Some(old) = self.subscription.take() {
                tracing::debug!("Released presence lookup for {}", old.target());
            }
            self.lookup.fetch_add(1, Ordering::SeqCst);
            self.online_tx.send_replace(None);
            return Ok(());
        };

        if self
            .subscription
            .as_ref()
            .map(|s| s.target() == &target)
            .unwrap_or(false)
        {
            return Ok(());
        }

        self.subscription = None;
        let lookup = self.lookup.fetch_add(1, Ordering::SeqCst) + 1;
        self.online_tx.send_replace(None);

        let current = Arc::clone(&self.lookup);
        let online_tx = Arc::clone(&self.online_tx);
        let subscription = self
            .presence
            .subscribe_online(&target, move |online| {
                if current.load(Ordering::SeqCst) == lookup {
                    online_tx.send_replace(Some(online));
                }
            })
            .await?;

        tracing::debug!("Watching presence of {}", target);
        self.subscription = Some(subscription);
        Ok(())
    }
}

impl std::fmt::Debug for DialPad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialPad")
            .field("digits", &self.digits)
            .field("online", &*self.online_tx.borrow())
            .finish()
    }
}
