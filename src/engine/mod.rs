use tracing::debug;

use crate::error::PermissionDenied;
use crate::protocol::{DirectorChanged, JoinMatch, MatchEvent, PlayerLeft, ReadyState};
use crate::types::{
    Layer, LayerVisibility, Match, MatchSnapshot, Notification, Phase, Player, PlayerId, Role,
    SubPhase, Team,
};

mod director;
mod readiness;
mod sector_system;

pub use self::director::elect_director;

/// Authoritative match progression. The engine never performs I/O: intents
/// return the events to send, and state changes are queued as notifications
/// until drained.
#[derive(Clone, Debug)]
pub struct MatchPhaseEngine {
    state: Match,
    notifications: Vec<Notification>,
}

impl MatchPhaseEngine {
    pub fn new(match_id: impl Into<String>) -> Self {
        Self {
            state: Match::new(match_id),
            notifications: Vec::new(),
        }
    }

    /// Builds a match from a known roster and elects the director once.
    pub fn with_players(match_id: impl Into<String>, players: Vec<Player>) -> Self {
        let mut engine = Self::new(match_id);
        engine.state.players = players;
        engine.install_director(elect_director(&engine.state.players));
        engine.notifications.clear();
        engine
    }

    pub fn state(&self) -> &Match {
        &self.state
    }

    pub fn match_id(&self) -> &str {
        &self.state.id
    }

    pub fn phase(&self) -> (Phase, SubPhase) {
        (self.state.phase, self.state.sub_phase)
    }

    pub fn director(&self) -> Option<&str> {
        self.state.director.as_deref()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Adds a player or marks a returning one connected. Used by the
    /// authority; clients learn about joins through `apply_remote`.
    pub fn join_player(&mut self, request: &JoinMatch) -> Player {
        if let Some(existing) = self.state.player_mut(&request.player_id) {
            existing.connected = true;
            if !request.display_name.is_empty() {
                existing.display_name = request.display_name.clone();
            }
            return existing.clone();
        }

        let team = match request.team {
            Some(team) => team,
            None => self.balanced_team(),
        };
        let player = Player {
            id: request.player_id.clone(),
            display_name: request.display_name.clone(),
            team,
            role: Role::Participant,
            ready: false,
            connected: true,
        };
        let index = self.state.players.len();
        self.state.players.push(player);

        let claims_director = request.role == Some(Role::Director);
        let replaces_temporary = self.in_setup() && self.state.is_temporary_director;
        if claims_director && (self.state.director.is_none() || replaces_temporary) {
            // A designated director joining during setup replaces the
            // temporary one; afterwards the election is frozen.
            self.install_director(Some((request.player_id.clone(), false)));
        } else if self.state.director.is_none() {
            self.install_director(elect_director(&self.state.players));
        }

        self.state.players[index].clone()
    }

    pub fn set_player_connected(&mut self, player_id: &str, connected: bool) -> bool {
        match self.state.player_mut(player_id) {
            Some(player) if player.connected != connected => {
                player.connected = connected;
                true
            }
            _ => false,
        }
    }

    /// Re-elects among the remaining connected players when the acting
    /// director leaves. Returns whether the director changed.
    pub fn director_left(&mut self, player_id: &str) -> bool {
        self.set_player_connected(player_id, false);
        if self.state.director.as_deref() != Some(player_id) {
            return false;
        }
        let candidates: Vec<Player> = self
            .state
            .players
            .iter()
            .filter(|player| player.connected && player.id != player_id)
            .cloned()
            .collect();
        let next = elect_director(&candidates).map(|(id, _)| (id, true));
        self.install_director(next);
        true
    }

    pub fn director_event(&self) -> MatchEvent {
        MatchEvent::DirectorChanged(DirectorChanged {
            match_id: self.state.id.clone(),
            director: self.state.director.clone(),
            is_temporary_director: self.state.is_temporary_director,
            timestamp: None,
        })
    }

    pub fn can_define_sector(&self, player_id: &str) -> bool {
        self.check_sector_authority(player_id).is_ok()
    }

    pub fn can_define_zones(&self, player_id: &str) -> bool {
        self.check_zone_authority(player_id).is_ok()
    }

    pub(crate) fn check_sector_authority(&self, player_id: &str) -> Result<(), PermissionDenied> {
        self.check_director(player_id)?;
        self.check_stage("sector definition", SubPhase::SectorDefinition)
    }

    pub(crate) fn check_zone_authority(&self, player_id: &str) -> Result<(), PermissionDenied> {
        self.check_director(player_id)?;
        self.check_stage("zone definition", SubPhase::ZoneDefinition)?;
        if !self.state.is_sector_confirmed() {
            return Err(PermissionDenied::SectorNotConfirmed);
        }
        Ok(())
    }

    fn check_director(&self, player_id: &str) -> Result<(), PermissionDenied> {
        if self.state.player(player_id).is_none() {
            return Err(PermissionDenied::UnknownPlayer(player_id.to_string()));
        }
        if self.state.director.as_deref() != Some(player_id) {
            return Err(PermissionDenied::NotDirector(player_id.to_string()));
        }
        Ok(())
    }

    fn check_stage(&self, action: &'static str, expected: SubPhase) -> Result<(), PermissionDenied> {
        if self.state.sub_phase != expected {
            return Err(PermissionDenied::WrongPhase {
                action,
                phase: self.state.phase,
                sub_phase: self.state.sub_phase,
            });
        }
        Ok(())
    }

    /// Applies an authority broadcast. Permission checks already happened on
    /// the authority, so only structural rules are enforced here.
    pub fn apply_remote(&mut self, event: &MatchEvent) {
        if let Some(timestamp) = event.timestamp() {
            self.state.last_update_timestamp = self.state.last_update_timestamp.max(timestamp);
        }
        match event {
            MatchEvent::JoinMatch(join) => self.apply_remote_join(join),
            MatchEvent::ConfirmSector(confirm) => self.apply_remote_sector(confirm),
            MatchEvent::ConfirmZone(confirm) => self.apply_remote_zone(confirm),
            MatchEvent::ReadyState(ready) => self.apply_remote_ready(ready),
            MatchEvent::DirectorChanged(change) => {
                let elected = change
                    .director
                    .clone()
                    .map(|id| (id, change.is_temporary_director));
                self.install_director(elected);
            }
            MatchEvent::PlayerLeft(PlayerLeft { player_id, .. }) => {
                self.set_player_connected(player_id, false);
            }
            MatchEvent::ProposeSector(_)
            | MatchEvent::ProposeZone(_)
            | MatchEvent::Heartbeat(_)
            | MatchEvent::RequestSnapshot(_) => {
                debug!(event = event.name(), "ignoring non-authoritative event");
            }
        }
    }

    fn apply_remote_join(&mut self, join: &JoinMatch) {
        let team = join.team.unwrap_or(Team::None);
        if let Some(player) = self.state.player_mut(&join.player_id) {
            player.connected = true;
            player.team = team;
            player.display_name = join.display_name.clone();
            return;
        }
        self.state.players.push(Player {
            id: join.player_id.clone(),
            display_name: join.display_name.clone(),
            team,
            role: Role::Participant,
            ready: false,
            connected: true,
        });
        if self.state.director.as_deref() == Some(join.player_id.as_str()) {
            self.refresh_roles();
        }
    }

    /// Full state for `requester`. Unconfirmed geometry is only included for
    /// the player who proposed it.
    pub fn snapshot_for(&self, requester: &str, timestamp: u64) -> MatchSnapshot {
        let visible = |confirmed: bool, proposed_by: &Option<PlayerId>| {
            confirmed || proposed_by.as_deref() == Some(requester)
        };
        MatchSnapshot {
            match_id: self.state.id.clone(),
            phase: self.state.phase,
            sub_phase: self.state.sub_phase,
            sector: self
                .state
                .sector
                .clone()
                .filter(|sector| visible(sector.confirmed, &sector.proposed_by)),
            zones: self
                .state
                .zones
                .iter()
                .filter(|zone| visible(zone.confirmed, &zone.proposed_by))
                .cloned()
                .collect(),
            players: self.state.players.clone(),
            director: self.state.director.clone(),
            is_temporary_director: self.state.is_temporary_director,
            turn: self.state.turn,
            timestamp,
        }
    }

    /// Authoritative overwrite. Local unconfirmed edits that the snapshot
    /// does not contain are discarded, never merged.
    pub fn restore(&mut self, snapshot: MatchSnapshot) {
        if (snapshot.phase, snapshot.sub_phase) != (self.state.phase, self.state.sub_phase) {
            self.notifications.push(Notification::PhaseChanged {
                phase: snapshot.phase,
                sub_phase: snapshot.sub_phase,
            });
        }
        if snapshot.sector != self.state.sector {
            self.notifications.push(Notification::SectorUpdated {
                polygon: snapshot.sector.as_ref().map(|sector| sector.polygon.clone()),
                confirmed: snapshot
                    .sector
                    .as_ref()
                    .map(|sector| sector.confirmed)
                    .unwrap_or(false),
            });
        }
        for team in [Team::Red, Team::Blue] {
            let incoming = snapshot.zones.iter().find(|zone| zone.team == team);
            if incoming != self.state.zone(team) {
                self.notifications.push(Notification::ZoneUpdated {
                    team,
                    polygon: incoming.map(|zone| zone.polygon.clone()),
                    confirmed: incoming.map(|zone| zone.confirmed).unwrap_or(false),
                });
            }
        }
        for player in &snapshot.players {
            let before = self.state.player(&player.id).map(|known| known.ready);
            if before != Some(player.ready) {
                self.notifications.push(Notification::PlayerReadyChanged {
                    player_id: player.id.clone(),
                    ready: player.ready,
                });
            }
        }
        if snapshot.director != self.state.director
            || snapshot.is_temporary_director != self.state.is_temporary_director
        {
            self.notifications.push(Notification::DirectorChanged {
                director: snapshot.director.clone(),
                temporary: snapshot.is_temporary_director,
            });
        }

        self.state.phase = snapshot.phase;
        self.state.sub_phase = snapshot.sub_phase;
        self.state.sector = snapshot.sector;
        self.state.zones = snapshot.zones;
        self.state.players = snapshot.players;
        self.state.director = snapshot.director;
        self.state.is_temporary_director = snapshot.is_temporary_director;
        self.state.turn = snapshot.turn;
        self.state.last_update_timestamp = snapshot.timestamp;
    }

    /// Render policy: the director sees every layer; a participant sees the
    /// own zone while the opposing one stays present at opacity 0.
    pub fn layer_visibility(&self, viewer: &str) -> Vec<LayerVisibility> {
        let mut layers = Vec::new();
        if self.state.sector.is_some() {
            layers.push(LayerVisibility {
                layer: Layer::Sector,
                opacity: 1.0,
            });
        }

        let is_director = self.state.director.as_deref() == Some(viewer);
        let viewer_team = self.state.player(viewer).map(|player| player.team);
        for zone in &self.state.zones {
            let opacity = if is_director || viewer_team == Some(zone.team) {
                1.0
            } else {
                0.0
            };
            layers.push(LayerVisibility {
                layer: Layer::Zone(zone.team),
                opacity,
            });
        }
        layers
    }

    fn install_director(&mut self, elected: Option<(PlayerId, bool)>) {
        let (director, temporary) = match elected {
            Some((id, temporary)) => (Some(id), temporary),
            None => (None, false),
        };
        if director == self.state.director && temporary == self.state.is_temporary_director {
            return;
        }
        self.state.director = director;
        self.state.is_temporary_director = temporary;
        self.refresh_roles();
        self.notifications.push(Notification::DirectorChanged {
            director: self.state.director.clone(),
            temporary,
        });
    }

    fn refresh_roles(&mut self) {
        let director = self.state.director.clone();
        for player in &mut self.state.players {
            player.role = if director.as_deref() == Some(player.id.as_str()) {
                Role::Director
            } else {
                Role::Participant
            };
        }
    }

    fn in_setup(&self) -> bool {
        self.state.sub_phase == SubPhase::SectorDefinition && self.state.sector.is_none()
    }

    fn balanced_team(&self) -> Team {
        let count = |team: Team| {
            self.state
                .players
                .iter()
                .filter(|player| player.team == team)
                .count()
        };
        if count(Team::Blue) < count(Team::Red) {
            Team::Blue
        } else {
            Team::Red
        }
    }

    fn set_sub_phase(&mut self, sub_phase: SubPhase) {
        self.state.phase = sub_phase.phase();
        self.state.sub_phase = sub_phase;
        self.notifications.push(Notification::PhaseChanged {
            phase: self.state.phase,
            sub_phase,
        });
    }

    fn ready_event(&self, player_id: &str, ready: bool) -> MatchEvent {
        MatchEvent::ReadyState(ReadyState {
            match_id: self.state.id.clone(),
            player_id: player_id.to_string(),
            ready,
            phase: self.state.phase,
            sub_phase: self.state.sub_phase,
            turn: self.state.turn.turn,
            timestamp: None,
        })
    }
}

#[cfg(test)]
mod tests;
