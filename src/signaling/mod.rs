//! Signaling Module - Call-Records im geteilten Store
//!
//! Ein Anrufversuch ist ein Record unter `calls/{callId}`:
//! - `from` / `to`: Teilnehmer
//! - `offer`: vom Anrufer, genau einmal
//! - `answer`: vom Angerufenen, höchstens einmal, erst nach dem Offer
//!
//! Alle Clients beobachten die gesamte Sammlung und filtern selbst.

mod channel;
mod record;

pub use channel::{AnswerWatch, CallUpdate, CallWatch, IncomingCalls, SignalingChannel};
pub use record::{CallId, CallRecord, SdpKind, SessionDescription};

use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Failed to write call record: {0}")]
    WriteFailed(StoreError),

    #[error("Failed to read call records: {0}")]
    ReadFailed(StoreError),

    #[error("Malformed call record {call_id}: {reason}")]
    Malformed { call_id: String, reason: String },
}
