use crate::endpoint::{EndpointError, EndpointId};
use crate::media::MediaError;
use crate::presence::PresenceError;
use crate::signaling::SignalingError;
use thiserror::Error;

/// Fehler der Call State Machine, wie sie die Oberfläche sieht
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("{0} is not reachable")]
    PeerUnreachable(EndpointId),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("No answer")]
    NoAnswer,

    #[error("Signaling write failed: {0}")]
    SignalingWriteFailed(String),

    #[error("Signaling read failed: {0}")]
    SignalingReadFailed(String),

    #[error("Presence write failed: {0}")]
    PresenceWriteFailed(String),

    #[error("Presence read failed: {0}")]
    PresenceReadFailed(String),

    #[error("Microphone unavailable: {0}")]
    MediaAcquisitionFailed(String),

    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Call machine stopped")]
    Stopped,
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        match e {
            SignalingError::WriteFailed(_) => CallError::SignalingWriteFailed(e.to_string()),
            SignalingError::ReadFailed(_) | SignalingError::Malformed { .. } => {
                CallError::SignalingReadFailed(e.to_string())
            }
        }
    }
}

impl From<PresenceError> for CallError {
    fn from(e: PresenceError) -> Self {
        match e {
            PresenceError::WriteFailed(_) => CallError::PresenceWriteFailed(e.to_string()),
            PresenceError::ReadFailed(_) => CallError::PresenceReadFailed(e.to_string()),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::AcquisitionFailed(reason) => CallError::MediaAcquisitionFailed(reason),
            other => CallError::PeerConnectionError(other.to_string()),
        }
    }
}

impl From<EndpointError> for CallError {
    fn from(e: EndpointError) -> Self {
        CallError::InvalidEndpoint(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_media_error_mapping() {
        assert_eq!(
            CallError::from(MediaError::AcquisitionFailed("denied".into())),
            CallError::MediaAcquisitionFailed("denied".into())
        );
        assert!(matches!(
            CallError::from(MediaError::InvalidSdp("x".into())),
            CallError::PeerConnectionError(_)
        ));
    }

    #[test]
    fn test_store_error_direction_is_kept() {
        let down = || StoreError::Unavailable("down".into());

        assert!(matches!(
            CallError::from(SignalingError::WriteFailed(down())),
            CallError::SignalingWriteFailed(_)
        ));
        assert!(matches!(
            CallError::from(SignalingError::ReadFailed(down())),
            CallError::SignalingReadFailed(_)
        ));
        assert!(matches!(
            CallError::from(SignalingError::Malformed {
                call_id: "c1".into(),
                reason: "missing field".into(),
            }),
            CallError::SignalingReadFailed(_)
        ));
        assert!(matches!(
            CallError::from(PresenceError::WriteFailed(down())),
            CallError::PresenceWriteFailed(_)
        ));
        assert!(matches!(
            CallError::from(PresenceError::ReadFailed(down())),
            CallError::PresenceReadFailed(_)
        ));
    }
}
