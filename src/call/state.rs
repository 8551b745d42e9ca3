//! Beobachtbarer Zustand eines Anrufs

use super::CallError;
use crate::endpoint::EndpointId;
use crate::signaling::CallId;

/// Phase der Call State Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf, Offer wird erzeugt
    Dialing,
    /// Offer veröffentlicht, wartet auf Answer
    Ringing,
    /// Eingehender Anruf wartet auf Annahme oder Ablehnung
    IncomingOffered,
    /// Offer und Answer ausgetauscht, noch kein Remote-Audio
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Anruf beendet, danach sofort wieder `Idle`
    Ended(EndReason),
}

/// Warum ein Anruf endete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Wir haben abgelehnt
    Declined,
    /// Die Gegenseite hat unser Offer abgelehnt
    Rejected,
    /// Der Anrufer hat vor der Annahme aufgelegt
    Cancelled,
    NoAnswer,
    /// Gleichzeitiger Anruf in beide Richtungen, unser Offer wurde verworfen
    Superseded,
    Failed(CallError),
}

/// Zustand für die Oberfläche
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub remote_id: Option<EndpointId>,
    pub call_id: Option<CallId>,
    pub elapsed_seconds: u64,
    pub muted: bool,
    pub speaker: bool,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            remote_id: None,
            call_id: None,
            elapsed_seconds: 0,
            muted: false,
            speaker: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == CallPhase::Idle
    }

    /// Anrufdauer als `mm:ss`
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed_seconds)
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Formatiert Sekunden als `mm:ss`; Minuten laufen über 59 hinaus weiter
pub fn format_elapsed(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Events der Call State Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallSnapshot),
    IncomingCall { call_id: CallId, from: EndpointId },
    /// Asynchroner Fehler, genau einmal gemeldet
    Failed(CallError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(59), "00:59");
        assert_eq!(format_elapsed(61), "01:01");
        assert_eq!(format_elapsed(3725), "62:05");
    }

    #[test]
    fn test_idle_snapshot() {
        let snapshot = CallSnapshot::default();
        assert!(snapshot.is_idle());
        assert_eq!(snapshot.elapsed_display(), "00:00");
    }
}
