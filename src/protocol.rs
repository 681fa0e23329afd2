use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, RemoteError};
use crate::types::{
    Bounds, DeploymentZone, Phase, Player, PlayerId, Point, Polygon, Role, SubPhase, Team,
    ZoneStyle,
};

pub mod events {
    pub const JOIN_MATCH: &str = "joinMatch";
    pub const PROPOSE_SECTOR: &str = "proposeSector";
    pub const CONFIRM_SECTOR: &str = "confirmSector";
    pub const PROPOSE_ZONE: &str = "proposeZone";
    pub const CONFIRM_ZONE: &str = "confirmZone";
    pub const READY_STATE: &str = "readyState";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const REQUEST_SNAPSHOT: &str = "requestSnapshot";
    pub const DIRECTOR_CHANGED: &str = "directorChanged";
    pub const PLAYER_LEFT: &str = "playerLeft";
    pub const CHAT_MESSAGE: &str = "chatMessage";
    pub const REPORT: &str = "report";
    pub const POSITION_UPDATE: &str = "positionUpdate";

    /// Events the phase engine consumes from the authority.
    pub const CORE: [&str; 6] = [
        JOIN_MATCH,
        CONFIRM_SECTOR,
        CONFIRM_ZONE,
        READY_STATE,
        DIRECTOR_CHANGED,
        PLAYER_LEFT,
    ];
}

/// One JSON frame on the transport, in either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    Emit {
        event: String,
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
        #[serde(rename = "eventId", default, skip_serializing_if = "Option::is_none")]
        event_id: Option<u64>,
        #[serde(default)]
        data: Value,
    },
    Ack {
        #[serde(rename = "ackId")]
        ack_id: u64,
        ok: bool,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
}

impl WireFrame {
    pub fn emit(event: impl Into<String>, data: Value) -> Self {
        Self::Emit {
            event: event.into(),
            ack_id: None,
            event_id: None,
            data,
        }
    }

    pub fn ack_ok(ack_id: u64, data: Value) -> Self {
        Self::Ack {
            ack_id,
            ok: true,
            data,
            error: None,
        }
    }

    pub fn ack_err(ack_id: u64, error: RemoteError) -> Self {
        Self::Ack {
            ack_id,
            ok: false,
            data: Value::Null,
            error: Some(error),
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Emit { event, .. } => Some(event),
            Self::Ack { .. } => None,
        }
    }
}

pub fn parse_frame(raw: &str) -> Result<WireFrame, ProtocolError> {
    serde_json::from_str(raw).map_err(|error| ProtocolError::InvalidFrame(error.to_string()))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinMatch {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "playerId")]
    pub player_id: PlayerId,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub team: Option<Team>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Authority reply to `joinMatch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinAccepted {
    pub player: Player,
    pub director: Option<PlayerId>,
    #[serde(rename = "isTemporaryDirector")]
    pub is_temporary_director: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposeSector {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub polygon: Polygon,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmSector {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub polygon: Polygon,
    pub bounds: Bounds,
    /// Peers transition only when this flag is set, never on geometry alone.
    #[serde(rename = "cambiarFase", default)]
    pub cambiar_fase: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposeZone {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub team: Team,
    pub polygon: Polygon,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZonePayload {
    pub team: Team,
    pub polygon: Polygon,
    pub bounds: Bounds,
    pub style: ZoneStyle,
}

impl ZonePayload {
    pub fn from_zone(zone: &DeploymentZone) -> Self {
        Self {
            team: zone.team,
            polygon: zone.polygon.clone(),
            bounds: crate::geometry::bounds_of(&zone.polygon),
            style: zone.style.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmZone {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub zone: ZonePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Readiness is scoped to the stage it was declared in so a late echo cannot
/// leak into the next sub-phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadyState {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "playerId")]
    pub player_id: PlayerId,
    pub ready: bool,
    pub phase: Phase,
    #[serde(rename = "subPhase")]
    pub sub_phase: SubPhase,
    pub turn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "playerId")]
    pub player_id: PlayerId,
    pub team: Option<Team>,
    #[serde(default)]
    pub position: Option<Point>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    #[serde(rename = "matchId")]
    pub match_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectorChanged {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub director: Option<PlayerId>,
    #[serde(rename = "isTemporaryDirector")]
    pub is_temporary_director: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeft {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "playerId")]
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MatchEvent {
    JoinMatch(JoinMatch),
    ProposeSector(ProposeSector),
    ConfirmSector(ConfirmSector),
    ProposeZone(ProposeZone),
    ConfirmZone(ConfirmZone),
    ReadyState(ReadyState),
    Heartbeat(Heartbeat),
    RequestSnapshot(RequestSnapshot),
    DirectorChanged(DirectorChanged),
    PlayerLeft(PlayerLeft),
}

impl MatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinMatch(_) => events::JOIN_MATCH,
            Self::ProposeSector(_) => events::PROPOSE_SECTOR,
            Self::ConfirmSector(_) => events::CONFIRM_SECTOR,
            Self::ProposeZone(_) => events::PROPOSE_ZONE,
            Self::ConfirmZone(_) => events::CONFIRM_ZONE,
            Self::ReadyState(_) => events::READY_STATE,
            Self::Heartbeat(_) => events::HEARTBEAT,
            Self::RequestSnapshot(_) => events::REQUEST_SNAPSHOT,
            Self::DirectorChanged(_) => events::DIRECTOR_CHANGED,
            Self::PlayerLeft(_) => events::PLAYER_LEFT,
        }
    }

    /// Authority timestamp of a phase update, if the event carries one.
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Self::JoinMatch(payload) => payload.timestamp,
            Self::ConfirmSector(payload) => payload.timestamp,
            Self::ConfirmZone(payload) => payload.timestamp,
            Self::ReadyState(payload) => payload.timestamp,
            Self::DirectorChanged(payload) => payload.timestamp,
            Self::PlayerLeft(payload) => payload.timestamp,
            Self::ProposeSector(_)
            | Self::ProposeZone(_)
            | Self::Heartbeat(_)
            | Self::RequestSnapshot(_) => None,
        }
    }

    pub fn stamp(&mut self, timestamp: u64) {
        let slot = match self {
            Self::JoinMatch(payload) => &mut payload.timestamp,
            Self::ConfirmSector(payload) => &mut payload.timestamp,
            Self::ConfirmZone(payload) => &mut payload.timestamp,
            Self::ReadyState(payload) => &mut payload.timestamp,
            Self::DirectorChanged(payload) => &mut payload.timestamp,
            Self::PlayerLeft(payload) => &mut payload.timestamp,
            Self::ProposeSector(_)
            | Self::ProposeZone(_)
            | Self::Heartbeat(_)
            | Self::RequestSnapshot(_) => return,
        };
        *slot = Some(timestamp);
    }

    pub fn to_data(&self) -> Value {
        let result = match self {
            Self::JoinMatch(payload) => serde_json::to_value(payload),
            Self::ProposeSector(payload) => serde_json::to_value(payload),
            Self::ConfirmSector(payload) => serde_json::to_value(payload),
            Self::ProposeZone(payload) => serde_json::to_value(payload),
            Self::ConfirmZone(payload) => serde_json::to_value(payload),
            Self::ReadyState(payload) => serde_json::to_value(payload),
            Self::Heartbeat(payload) => serde_json::to_value(payload),
            Self::RequestSnapshot(payload) => serde_json::to_value(payload),
            Self::DirectorChanged(payload) => serde_json::to_value(payload),
            Self::PlayerLeft(payload) => serde_json::to_value(payload),
        };
        // Plain data structs with string keys always serialize.
        result.unwrap_or(Value::Null)
    }

    /// Parses a named event. `Ok(None)` means the name is not a match event
    /// (chat, reports and other relayed traffic).
    pub fn from_wire(event: &str, data: &Value) -> Result<Option<Self>, ProtocolError> {
        let parsed = match event {
            events::JOIN_MATCH => Self::JoinMatch(decode(event, data)?),
            events::PROPOSE_SECTOR => Self::ProposeSector(decode(event, data)?),
            events::CONFIRM_SECTOR => Self::ConfirmSector(decode(event, data)?),
            events::PROPOSE_ZONE => Self::ProposeZone(decode(event, data)?),
            events::CONFIRM_ZONE => Self::ConfirmZone(decode(event, data)?),
            events::READY_STATE => Self::ReadyState(decode(event, data)?),
            events::HEARTBEAT => Self::Heartbeat(decode(event, data)?),
            events::REQUEST_SNAPSHOT => Self::RequestSnapshot(decode(event, data)?),
            events::DIRECTOR_CHANGED => Self::DirectorChanged(decode(event, data)?),
            events::PLAYER_LEFT => Self::PlayerLeft(decode(event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

fn decode<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|error| ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_emit_frame_with_ack() {
        let frame = parse_frame(
            r#"{"type":"emit","event":"proposeSector","ackId":7,"data":{"matchId":"m1","polygon":[{"lat":0,"lng":0},{"lat":0,"lng":1},{"lat":1,"lng":1}]}}"#,
        )
        .expect("emit frame should parse");
        match frame {
            WireFrame::Emit {
                event,
                ack_id,
                event_id,
                data,
            } => {
                assert_eq!(event, "proposeSector");
                assert_eq!(ack_id, Some(7));
                assert_eq!(event_id, None);
                let parsed = MatchEvent::from_wire(&event, &data).expect("payload should parse");
                assert!(matches!(parsed, Some(MatchEvent::ProposeSector(_))));
            }
            _ => panic!("expected emit frame"),
        }
    }

    #[test]
    fn parse_negative_ack() {
        let frame = parse_frame(
            r#"{"type":"ack","ackId":3,"ok":false,"error":{"kind":"permission","message":"nope"}}"#,
        )
        .expect("ack frame should parse");
        match frame {
            WireFrame::Ack { ok, error, .. } => {
                assert!(!ok);
                assert!(error.expect("error payload").kind.is_terminal());
            }
            _ => panic!("expected ack frame"),
        }
    }

    #[test]
    fn confirm_sector_carries_cambiar_fase_flag() {
        let event = MatchEvent::ConfirmSector(ConfirmSector {
            match_id: "m1".to_string(),
            polygon: Polygon::new(vec![
                Point::new(0.0, 0.0),
                Point::new(0.0, 1.0),
                Point::new(1.0, 1.0),
            ]),
            bounds: Bounds {
                south: 0.0,
                west: 0.0,
                north: 1.0,
                east: 1.0,
            },
            cambiar_fase: true,
            timestamp: Some(42),
        });
        let data = event.to_data();
        assert_eq!(data["cambiarFase"], json!(true));
        assert_eq!(data["timestamp"], json!(42));
    }

    #[test]
    fn unknown_events_are_not_match_events() {
        let parsed = MatchEvent::from_wire("chatMessage", &json!({"text": "hi"}))
            .expect("relay payload is not validated");
        assert!(parsed.is_none());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let result = MatchEvent::from_wire("readyState", &json!({"matchId": "m1"}));
        assert!(matches!(result, Err(ProtocolError::InvalidPayload { .. })));
    }

    #[test]
    fn invalid_frame_is_rejected() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"type":"unknown"}"#).is_err());
    }
}
