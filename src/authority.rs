//! The authoritative peer for one match. It validates intents with the same
//! phase engine the clients run, stamps what it broadcasts, answers snapshot
//! requests and replays cached acknowledgements for retried requests.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::constants::REPLY_CACHE_PER_PLAYER;
use crate::engine::MatchPhaseEngine;
use crate::error::{MatchError, PermissionDenied, RemoteError, RemoteErrorKind, ValidationError};
use crate::protocol::{events, JoinAccepted, JoinMatch, MatchEvent, PlayerLeft, WireFrame};
use crate::types::PlayerId;
use crate::utils::{now_ms, sanitize_name};

/// Relayed verbatim to the other members of the match.
const RELAYED: [&str; 3] = [events::CHAT_MESSAGE, events::REPORT, events::POSITION_UPDATE];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(PlayerId),
}

impl Audience {
    pub fn includes(&self, player_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(excluded) => excluded != player_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    pub audience: Audience,
    pub frame: WireFrame,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthorityOutcome {
    /// Acknowledgement for the sender, present when the request carried an
    /// ack id.
    pub reply: Option<WireFrame>,
    pub broadcasts: Vec<Outbound>,
}

pub struct MatchAuthority {
    engine: MatchPhaseEngine,
    last_timestamp: u64,
    next_event_id: u64,
    replies: HashMap<PlayerId, VecDeque<(u64, WireFrame)>>,
}

impl MatchAuthority {
    pub fn new(match_id: impl Into<String>) -> Self {
        Self {
            engine: MatchPhaseEngine::new(match_id),
            last_timestamp: 0,
            next_event_id: 1,
            replies: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &MatchPhaseEngine {
        &self.engine
    }

    pub fn match_id(&self) -> &str {
        self.engine.match_id()
    }

    /// Handles one frame from `player_id`.
    pub fn handle(&mut self, player_id: &str, frame: WireFrame) -> AuthorityOutcome {
        let WireFrame::Emit {
            event,
            ack_id,
            data,
            ..
        } = frame
        else {
            debug!(player_id, "ignoring acknowledgement sent to the authority");
            return AuthorityOutcome::default();
        };

        // A join starts a new client lifetime whose ack ids restart from 1.
        if event == events::JOIN_MATCH {
            self.replies.remove(player_id);
        } else if let Some(cached) = ack_id.and_then(|ack_id| self.cached_reply(player_id, ack_id)) {
            debug!(player_id, event = %event, "replaying cached acknowledgement");
            return AuthorityOutcome {
                reply: Some(cached),
                broadcasts: Vec::new(),
            };
        }

        let result = self.apply(player_id, &event, &data);
        for notification in self.engine.take_notifications() {
            debug!(match_id = %self.engine.match_id(), ?notification, "match updated");
        }

        let (reply_data, broadcasts) = match result {
            Ok((reply, broadcasts)) => (Ok(reply), broadcasts),
            Err(error) => {
                warn!(player_id, event = %event, %error, "rejected intent");
                (Err(error), Vec::new())
            }
        };
        let reply = ack_id.map(|ack_id| {
            let frame = match reply_data {
                Ok(data) => WireFrame::ack_ok(ack_id, data),
                Err(error) => WireFrame::ack_err(ack_id, error),
            };
            self.remember(player_id, ack_id, frame.clone());
            frame
        });
        AuthorityOutcome { reply, broadcasts }
    }

    /// Flips the player to disconnected and, if they were directing,
    /// re-elects and announces the new director.
    pub fn player_disconnected(&mut self, player_id: &str) -> Vec<Outbound> {
        self.replies.remove(player_id);
        let connected = self
            .engine
            .state()
            .player(player_id)
            .map(|player| player.connected);
        if connected != Some(true) {
            return Vec::new();
        }

        info!(match_id = %self.engine.match_id(), player_id, "player disconnected");
        let director_changed = self.engine.director_left(player_id);
        self.engine.take_notifications();

        let left = MatchEvent::PlayerLeft(PlayerLeft {
            match_id: self.engine.match_id().to_string(),
            player_id: player_id.to_string(),
            timestamp: None,
        });
        let mut outbound = vec![self.stamped(Audience::AllExcept(player_id.to_string()), left)];
        if director_changed {
            info!(director = ?self.engine.director(), "director re-elected");
            let change = self.engine.director_event();
            outbound.push(self.stamped(Audience::All, change));
        }
        outbound
    }

    /// Strictly increasing millisecond timestamp, even when two updates
    /// land within the same millisecond.
    pub fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp = now_ms().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn apply(&mut self, player_id: &str, event: &str, data: &Value) -> Result<(Value, Vec<Outbound>), RemoteError> {
        let parsed = MatchEvent::from_wire(event, data).map_err(|error| RemoteError::from(&error))?;
        let Some(parsed) = parsed else {
            return self.relay(player_id, event, data);
        };

        let engine_events = match parsed {
            MatchEvent::JoinMatch(join) => return self.join(player_id, join),
            MatchEvent::ProposeSector(proposal) => {
                self.engine
                    .propose_sector(player_id, proposal.polygon)
                    .map_err(reject)?;
                Vec::new()
            }
            MatchEvent::ConfirmSector(confirm) => {
                if self.engine.state().is_sector_confirmed() {
                    Vec::new()
                } else {
                    self.engine
                        .propose_sector(player_id, confirm.polygon)
                        .map_err(reject)?;
                    self.engine.confirm_sector(player_id).map_err(reject)?
                }
            }
            MatchEvent::ProposeZone(proposal) => {
                self.engine
                    .propose_zone(player_id, proposal.team, proposal.polygon)
                    .map_err(reject)?;
                Vec::new()
            }
            MatchEvent::ConfirmZone(confirm) => {
                let team = confirm.zone.team;
                if self.engine.state().is_zone_confirmed(team) {
                    Vec::new()
                } else {
                    self.engine
                        .propose_zone(player_id, team, confirm.zone.polygon)
                        .map_err(reject)?;
                    self.engine.confirm_zone(player_id, team).map_err(reject)?
                }
            }
            MatchEvent::ReadyState(ready) => {
                if !ready.ready {
                    return Err(reject(ValidationError::ReadinessWithdrawn.into()));
                }
                self.engine.accept_ready(player_id, &ready).map_err(reject)?
            }
            MatchEvent::Heartbeat(_) => {
                self.require_member(player_id)?;
                Vec::new()
            }
            MatchEvent::RequestSnapshot(_) => {
                self.require_member(player_id)?;
                let timestamp = self.next_timestamp();
                let snapshot = self.engine.snapshot_for(player_id, timestamp);
                let data = serde_json::to_value(snapshot)
                    .map_err(|error| RemoteError::new(RemoteErrorKind::Internal, error.to_string()))?;
                return Ok((data, Vec::new()));
            }
            MatchEvent::DirectorChanged(_) | MatchEvent::PlayerLeft(_) => {
                return Err(RemoteError::new(
                    RemoteErrorKind::Permission,
                    format!("{event} is issued by the authority only"),
                ));
            }
        };

        let audience = Audience::AllExcept(player_id.to_string());
        let broadcasts = engine_events
            .into_iter()
            .map(|event| self.stamped(audience.clone(), event))
            .collect();
        Ok((Value::Null, broadcasts))
    }

    fn join(&mut self, player_id: &str, mut join: JoinMatch) -> Result<(Value, Vec<Outbound>), RemoteError> {
        if join.player_id != player_id {
            return Err(reject(
                PermissionDenied::ActingForOther {
                    actor: player_id.to_string(),
                    target: join.player_id,
                }
                .into(),
            ));
        }
        join.display_name = sanitize_name(&join.display_name);

        let director_before = (
            self.engine.director().map(str::to_string),
            self.engine.state().is_temporary_director,
        );
        let player = self.engine.join_player(&join);
        info!(
            match_id = %self.engine.match_id(),
            player_id,
            team = ?player.team,
            "player joined"
        );

        let echo = MatchEvent::JoinMatch(JoinMatch {
            team: Some(player.team),
            role: Some(player.role),
            display_name: player.display_name.clone(),
            ..join
        });
        let mut broadcasts = vec![self.stamped(Audience::AllExcept(player_id.to_string()), echo)];
        let director_after = (
            self.engine.director().map(str::to_string),
            self.engine.state().is_temporary_director,
        );
        if director_after != director_before {
            let change = self.engine.director_event();
            broadcasts.push(self.stamped(Audience::All, change));
        }

        let accepted = JoinAccepted {
            player: self.engine.state().player(player_id).cloned().unwrap_or(player),
            director: director_after.0,
            is_temporary_director: director_after.1,
        };
        let data = serde_json::to_value(accepted)
            .map_err(|error| RemoteError::new(RemoteErrorKind::Internal, error.to_string()))?;
        Ok((data, broadcasts))
    }

    fn relay(&mut self, player_id: &str, event: &str, data: &Value) -> Result<(Value, Vec<Outbound>), RemoteError> {
        if !RELAYED.contains(&event) {
            return Err(RemoteError::new(
                RemoteErrorKind::Protocol,
                format!("unknown event {event}"),
            ));
        }
        self.require_member(player_id)?;
        let frame = WireFrame::Emit {
            event: event.to_string(),
            ack_id: None,
            event_id: Some(self.take_event_id()),
            data: data.clone(),
        };
        Ok((
            Value::Null,
            vec![Outbound {
                audience: Audience::AllExcept(player_id.to_string()),
                frame,
            }],
        ))
    }

    fn require_member(&self, player_id: &str) -> Result<(), RemoteError> {
        if self.engine.state().player(player_id).is_none() {
            return Err(reject(
                PermissionDenied::UnknownPlayer(player_id.to_string()).into(),
            ));
        }
        Ok(())
    }

    fn stamped(&mut self, audience: Audience, mut event: MatchEvent) -> Outbound {
        let timestamp = self.next_timestamp();
        event.stamp(timestamp);
        let frame = WireFrame::Emit {
            event: event.name().to_string(),
            ack_id: None,
            event_id: Some(self.take_event_id()),
            data: event.to_data(),
        };
        Outbound { audience, frame }
    }

    fn take_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    fn cached_reply(&self, player_id: &str, ack_id: u64) -> Option<WireFrame> {
        self.replies
            .get(player_id)?
            .iter()
            .find(|(cached_id, _)| *cached_id == ack_id)
            .map(|(_, frame)| frame.clone())
    }

    fn remember(&mut self, player_id: &str, ack_id: u64, frame: WireFrame) {
        let cache = self.replies.entry(player_id.to_string()).or_default();
        cache.push_back((ack_id, frame));
        while cache.len() > REPLY_CACHE_PER_PLAYER {
            cache.pop_front();
        }
    }
}

fn reject(error: MatchError) -> RemoteError {
    RemoteError::from(&error)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::SubPhase;

    fn emit(event: &str, ack_id: u64, data: Value) -> WireFrame {
        WireFrame::Emit {
            event: event.to_string(),
            ack_id: Some(ack_id),
            event_id: None,
            data,
        }
    }

    fn join(authority: &mut MatchAuthority, player_id: &str, team: &str, role: Option<&str>) -> AuthorityOutcome {
        authority.handle(
            player_id,
            emit(
                events::JOIN_MATCH,
                1,
                json!({
                    "matchId": "m1",
                    "playerId": player_id,
                    "displayName": player_id,
                    "team": team,
                    "role": role,
                }),
            ),
        )
    }

    fn square(min: f64, max: f64) -> Value {
        json!([
            { "lat": min, "lng": min },
            { "lat": min, "lng": max },
            { "lat": max, "lng": max },
            { "lat": max, "lng": min },
        ])
    }

    fn confirm_sector_frame(ack_id: u64) -> WireFrame {
        emit(
            events::CONFIRM_SECTOR,
            ack_id,
            json!({
                "matchId": "m1",
                "polygon": square(0.0, 10.0),
                "bounds": { "south": 0.0, "west": 0.0, "north": 10.0, "east": 10.0 },
                "cambiarFase": true,
            }),
        )
    }

    fn ack_ok(outcome: &AuthorityOutcome) -> bool {
        matches!(outcome.reply, Some(WireFrame::Ack { ok: true, .. }))
    }

    fn error_kind(outcome: &AuthorityOutcome) -> Option<RemoteErrorKind> {
        match &outcome.reply {
            Some(WireFrame::Ack {
                error: Some(error), ..
            }) => Some(error.kind),
            _ => None,
        }
    }

    #[test]
    fn first_join_elects_a_temporary_director() {
        let mut authority = MatchAuthority::new("m1");
        let outcome = join(&mut authority, "blue1", "blue", None);
        assert!(ack_ok(&outcome));
        assert_eq!(authority.engine().director(), Some("blue1"));
        assert!(authority.engine().state().is_temporary_director);
        assert!(outcome
            .broadcasts
            .iter()
            .any(|out| out.frame.event_name() == Some(events::DIRECTOR_CHANGED)));
    }

    #[test]
    fn sector_confirmation_is_broadcast_once_even_when_retried() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        join(&mut authority, "r", "red", None);

        let first = authority.handle("d", confirm_sector_frame(7));
        assert!(ack_ok(&first));
        assert_eq!(first.broadcasts.len(), 1);
        assert_eq!(first.broadcasts[0].audience, Audience::AllExcept("d".to_string()));
        match &first.broadcasts[0].frame {
            WireFrame::Emit { event, data, event_id, .. } => {
                assert_eq!(event, events::CONFIRM_SECTOR);
                assert_eq!(data["cambiarFase"], json!(true));
                assert!(data["timestamp"].as_u64().is_some());
                assert!(event_id.is_some());
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let retried = authority.handle("d", confirm_sector_frame(7));
        assert_eq!(retried.reply, first.reply);
        assert!(retried.broadcasts.is_empty());

        let again = authority.handle("d", confirm_sector_frame(8));
        assert!(ack_ok(&again));
        assert!(again.broadcasts.is_empty());
        assert_eq!(authority.engine().phase().1, SubPhase::ZoneDefinition);
    }

    #[test]
    fn rejoining_client_is_not_served_replies_from_its_previous_lifetime() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        join(&mut authority, "p", "red", None);
        let before = authority.handle("p", emit(events::REQUEST_SNAPSHOT, 2, json!({ "matchId": "m1" })));
        assert!(ack_ok(&before));

        authority.player_disconnected("p");
        assert!(ack_ok(&authority.handle("d", confirm_sector_frame(3))));

        // A fresh client starts numbering acks from 1 again.
        let rejoined = join(&mut authority, "p", "red", None);
        assert!(ack_ok(&rejoined));
        assert!(!rejoined.broadcasts.is_empty());
        assert_eq!(
            authority.engine().state().player("p").map(|player| player.connected),
            Some(true)
        );

        let after = authority.handle("p", emit(events::REQUEST_SNAPSHOT, 2, json!({ "matchId": "m1" })));
        assert_ne!(after.reply, before.reply);
        match after.reply {
            Some(WireFrame::Ack { ok: true, data, .. }) => {
                assert_eq!(data["subPhase"], json!("zoneDefinition"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn join_with_a_reused_ack_id_is_applied_while_connected() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        join(&mut authority, "p", "red", None);
        assert!(ack_ok(&authority.handle("p", emit(events::CHAT_MESSAGE, 2, json!({ "text": "old" })))));

        // The replaced client never disconnected cleanly.
        join(&mut authority, "p", "red", None);
        let chat = authority.handle("p", emit(events::CHAT_MESSAGE, 2, json!({ "text": "new" })));
        assert_eq!(chat.broadcasts.len(), 1);
    }

    #[test]
    fn non_director_intents_are_rejected_with_permission() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        join(&mut authority, "r", "red", None);

        let outcome = authority.handle("r", confirm_sector_frame(3));
        assert_eq!(error_kind(&outcome), Some(RemoteErrorKind::Permission));
        assert!(outcome.broadcasts.is_empty());
        assert!(authority.engine().state().sector.is_none());

        let forged = authority.handle(
            "r",
            emit(
                events::PLAYER_LEFT,
                4,
                json!({ "matchId": "m1", "playerId": "d" }),
            ),
        );
        assert_eq!(error_kind(&forged), Some(RemoteErrorKind::Permission));
    }

    #[test]
    fn malformed_payloads_are_protocol_errors() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        let outcome = authority.handle("d", emit(events::PROPOSE_ZONE, 2, json!({ "team": 5 })));
        assert_eq!(error_kind(&outcome), Some(RemoteErrorKind::Protocol));
        let unknown = authority.handle("d", emit("launchMissiles", 3, json!({})));
        assert_eq!(error_kind(&unknown), Some(RemoteErrorKind::Protocol));
    }

    #[test]
    fn snapshot_reply_carries_fresh_timestamp() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        let before = authority.next_timestamp();
        let outcome = authority.handle("d", emit(events::REQUEST_SNAPSHOT, 9, json!({ "matchId": "m1" })));
        match outcome.reply {
            Some(WireFrame::Ack { ok: true, data, .. }) => {
                assert!(data["timestamp"].as_u64().unwrap_or(0) > before);
                assert_eq!(data["players"].as_array().map(Vec::len), Some(1));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut authority = MatchAuthority::new("m1");
        let stamps: Vec<u64> = (0..50).map(|_| authority.next_timestamp()).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn chat_is_relayed_to_everyone_else() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "blue", Some("director"));
        let outcome = authority.handle("d", emit(events::CHAT_MESSAGE, 5, json!({ "text": "hold" })));
        assert!(ack_ok(&outcome));
        assert_eq!(outcome.broadcasts.len(), 1);
        assert!(!outcome.broadcasts[0].audience.includes("d"));
        assert!(outcome.broadcasts[0].audience.includes("r"));
    }

    #[test]
    fn director_disconnect_triggers_re_election() {
        let mut authority = MatchAuthority::new("m1");
        join(&mut authority, "d", "red", Some("director"));
        join(&mut authority, "b", "blue", None);

        let outbound = authority.player_disconnected("d");
        let names: Vec<&str> = outbound
            .iter()
            .filter_map(|out| out.frame.event_name())
            .collect();
        assert_eq!(names, vec![events::PLAYER_LEFT, events::DIRECTOR_CHANGED]);
        assert_eq!(authority.engine().director(), Some("b"));
        assert!(authority.player_disconnected("d").is_empty());

        let zone = authority.handle(
            "b",
            emit(
                events::PROPOSE_ZONE,
                6,
                json!({ "matchId": "m1", "team": "red", "polygon": square(1.0, 2.0) }),
            ),
        );
        // Still in sector definition.
        assert_eq!(error_kind(&zone), Some(RemoteErrorKind::Permission));
    }
}
