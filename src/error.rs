//! Error taxonomy shared by the phase engine, the connection layer and the
//! authority.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::queue::EventClass;
use crate::types::{Phase, PlayerId, SubPhase, Team};

/// The caller lacks director authority or acted in the wrong phase.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PermissionDenied {
    #[error("player {0} is not part of this match")]
    UnknownPlayer(PlayerId),
    #[error("player {0} is not the acting director")]
    NotDirector(PlayerId),
    #[error("{action} is not allowed during {phase:?}/{sub_phase:?}")]
    WrongPhase {
        action: &'static str,
        phase: Phase,
        sub_phase: SubPhase,
    },
    #[error("the sector has not been confirmed")]
    SectorNotConfirmed,
    #[error("player {actor} cannot act on behalf of {target}")]
    ActingForOther { actor: PlayerId, target: PlayerId },
}

/// A mutation that names the rule it violates.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ValidationError {
    #[error("polygon needs at least 3 points, got {0}")]
    TooFewPoints(usize),
    #[error("polygon point {index} is not a valid coordinate")]
    InvalidCoordinate { index: usize },
    #[error("no sector has been proposed")]
    NoSectorProposed,
    #[error("no {0:?} zone has been proposed")]
    NoZoneProposed(Team),
    #[error("zones can only be defined for the red or blue team")]
    InvalidTeam,
    #[error("the blue zone requires a confirmed red zone")]
    ZoneOrdering,
    #[error("the {0:?} zone is already confirmed")]
    ZoneAlreadyConfirmed(Team),
    #[error("{team:?} zone vertex {index} lies outside the sector")]
    ZoneOutsideSector { team: Team, index: usize },
    #[error("{team:?} zone edge {index} crosses the sector boundary")]
    ZoneCrossesSector { team: Team, index: usize },
    #[error("readiness refers to a stage that is no longer current")]
    StaleStage,
    #[error("readiness cannot be withdrawn once declared")]
    ReadinessWithdrawn,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum MatchError {
    #[error("permission denied: {0}")]
    Permission(#[from] PermissionDenied),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// An update whose timestamp is not newer than the last one applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("stale update at {timestamp} (last applied {last_applied})")]
pub struct StaleState {
    pub timestamp: u64,
    pub last_applied: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Permission,
    Validation,
    Protocol,
    Internal,
}

impl RemoteErrorKind {
    /// Retrying an invalid mutation cannot succeed.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Internal)
    }
}

/// Error payload carried by a negative acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&MatchError> for RemoteError {
    fn from(error: &MatchError) -> Self {
        let kind = match error {
            MatchError::Permission(_) => RemoteErrorKind::Permission,
            MatchError::Validation(_) => RemoteErrorKind::Validation,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<&ProtocolError> for RemoteError {
    fn from(error: &ProtocolError) -> Self {
        Self::new(RemoteErrorKind::Protocol, error.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{event} was not acknowledged within {after_ms}ms")]
    Timeout { event: String, after_ms: u64 },
    #[error("{event} failed after {attempts} attempts")]
    RetriesExhausted { event: String, attempts: u32 },
    #[error("{event} queued as {class:?} until the connection returns")]
    Queued { event: String, class: EventClass },
    #[error("not connected")]
    NotConnected,
    #[error("a session already exists for this match")]
    SessionExists,
    #[error("remote rejected the event: {0}")]
    Remote(RemoteError),
    #[error("malformed payload: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Terminal errors end a send immediately instead of consuming retries.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Remote(remote) => remote.kind.is_terminal(),
            Self::Queued { .. } | Self::SessionExists | Self::Protocol(_) => true,
            Self::Transport(_)
            | Self::Timeout { .. }
            | Self::RetriesExhausted { .. }
            | Self::NotConnected => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Failure reported by an event handler or observer. Logged, never
/// propagated to the dispatcher's caller.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}
