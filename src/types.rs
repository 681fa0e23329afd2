use serde::{Deserialize, Serialize};

pub type PlayerId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Red,
    Blue,
    None,
}

impl Team {
    pub fn is_playing(self) -> bool {
        self != Self::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Director,
    Participant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Preparation,
    Combat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubPhase {
    SectorDefinition,
    ZoneDefinition,
    Deployment,
    Movement,
    Engagement,
}

impl SubPhase {
    pub fn phase(self) -> Phase {
        match self {
            Self::SectorDefinition | Self::ZoneDefinition | Self::Deployment => Phase::Preparation,
            Self::Movement | Self::Engagement => Phase::Combat,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Ordered ring of points. The closing edge from the last point back to the
/// first is implicit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon(pub Vec<Point>);

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    pub polygon: Polygon,
    pub confirmed: bool,
    #[serde(rename = "proposedBy", default)]
    pub proposed_by: Option<PlayerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneStyle {
    pub color: String,
    #[serde(rename = "fillOpacity")]
    pub fill_opacity: f64,
}

impl ZoneStyle {
    pub fn for_team(team: Team) -> Self {
        let color = match team {
            Team::Red => "#d32f2f",
            Team::Blue => "#1976d2",
            Team::None => "#9e9e9e",
        };
        Self {
            color: color.to_string(),
            fill_opacity: 0.3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentZone {
    pub team: Team,
    pub polygon: Polygon,
    pub confirmed: bool,
    pub style: ZoneStyle,
    #[serde(rename = "proposedBy", default)]
    pub proposed_by: Option<PlayerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub team: Team,
    pub role: Role,
    pub ready: bool,
    pub connected: bool,
}

/// Turn counter owned by the combat phase. `turn == 0` until combat starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnClock {
    pub turn: u32,
    #[serde(rename = "startedAtMs")]
    pub started_at_ms: u64,
}

impl TurnClock {
    pub fn start(&mut self, now_ms: u64) {
        self.turn = 1;
        self.started_at_ms = now_ms;
    }

    pub fn advance(&mut self, now_ms: u64) {
        self.turn += 1;
        self.started_at_ms = now_ms;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub phase: Phase,
    #[serde(rename = "subPhase")]
    pub sub_phase: SubPhase,
    pub sector: Option<Sector>,
    pub zones: Vec<DeploymentZone>,
    pub players: Vec<Player>,
    pub director: Option<PlayerId>,
    #[serde(rename = "isTemporaryDirector")]
    pub is_temporary_director: bool,
    #[serde(rename = "lastUpdateTimestamp")]
    pub last_update_timestamp: u64,
    pub turn: TurnClock,
}

impl Match {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: Phase::Preparation,
            sub_phase: SubPhase::SectorDefinition,
            sector: None,
            zones: Vec::new(),
            players: Vec::new(),
            director: None,
            is_temporary_director: false,
            last_update_timestamp: 0,
            turn: TurnClock::default(),
        }
    }

    pub fn player(&self, player_id: &str) -> Option<&Player> {
        self.players.iter().find(|player| player.id == player_id)
    }

    pub fn player_mut(&mut self, player_id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|player| player.id == player_id)
    }

    pub fn zone(&self, team: Team) -> Option<&DeploymentZone> {
        self.zones.iter().find(|zone| zone.team == team)
    }

    pub fn zone_mut(&mut self, team: Team) -> Option<&mut DeploymentZone> {
        self.zones.iter_mut().find(|zone| zone.team == team)
    }

    pub fn is_zone_confirmed(&self, team: Team) -> bool {
        self.zone(team).map(|zone| zone.confirmed).unwrap_or(false)
    }

    pub fn is_sector_confirmed(&self) -> bool {
        self.sector.as_ref().map(|sector| sector.confirmed).unwrap_or(false)
    }
}

/// Full authoritative state handed to a (re)connecting client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub phase: Phase,
    #[serde(rename = "subPhase")]
    pub sub_phase: SubPhase,
    pub sector: Option<Sector>,
    pub zones: Vec<DeploymentZone>,
    pub players: Vec<Player>,
    pub director: Option<PlayerId>,
    #[serde(rename = "isTemporaryDirector")]
    pub is_temporary_director: bool,
    pub turn: TurnClock,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "team", rename_all = "snake_case")]
pub enum Layer {
    Sector,
    Zone(Team),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LayerVisibility {
    pub layer: Layer,
    pub opacity: f64,
}

/// Change notifications for rendering and UI collaborators.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    PhaseChanged {
        phase: Phase,
        #[serde(rename = "subPhase")]
        sub_phase: SubPhase,
    },
    SectorUpdated {
        polygon: Option<Polygon>,
        confirmed: bool,
    },
    ZoneUpdated {
        team: Team,
        polygon: Option<Polygon>,
        confirmed: bool,
    },
    ConnectionStateChanged {
        connected: bool,
    },
    PlayerReadyChanged {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        ready: bool,
    },
    DirectorChanged {
        director: Option<PlayerId>,
        temporary: bool,
    },
}

/// Who this client is inside a match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "playerId")]
    pub player_id: PlayerId,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub team: Option<Team>,
    pub role: Option<Role>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchContext {
    #[serde(rename = "matchId")]
    pub match_id: String,
}
