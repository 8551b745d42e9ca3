//! Call Module - Call State Machine
//!
//! Ein Task pro Endpunkt besitzt die aktive Session. Befehle der
//! Oberfläche, Store-Beobachtungen und Peer-Connection-Events laufen
//! alle über diesen Task:
//! - `CallHandle` schickt Befehle und liest den Zustand
//! - `CallSnapshot` ist über einen `watch`-Kanal beobachtbar
//! - `CallEvent` wird an alle Abonnenten gebroadcastet

mod error;
mod machine;
mod state;

pub use error::CallError;
pub use machine::{CallHandle, CallMachine};
pub use state::{format_elapsed, CallEvent, CallPhase, CallSnapshot, EndReason};
