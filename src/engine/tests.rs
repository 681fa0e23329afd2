use super::*;
use crate::error::{MatchError, ValidationError};
use crate::protocol::ConfirmSector;
use crate::types::{Point, Polygon};

fn player(id: &str, team: Team, role: Role) -> Player {
    Player {
        id: id.to_string(),
        display_name: id.to_uppercase(),
        team,
        role,
        ready: false,
        connected: true,
    }
}

fn square(min: f64, max: f64) -> Polygon {
    Polygon::new(vec![
        Point::new(min, min),
        Point::new(min, max),
        Point::new(max, max),
        Point::new(max, min),
    ])
}

/// Director `d` (designated, blue), participants `r` (red) and `b` (blue).
fn three_player_match() -> MatchPhaseEngine {
    MatchPhaseEngine::with_players(
        "m1",
        vec![
            player("d", Team::Blue, Role::Director),
            player("r", Team::Red, Role::Participant),
            player("b", Team::Blue, Role::Participant),
        ],
    )
}

fn engine_in_deployment() -> MatchPhaseEngine {
    let mut engine = three_player_match();
    engine.propose_sector("d", square(0.0, 10.0)).expect("propose sector");
    engine.confirm_sector("d").expect("confirm sector");
    engine.propose_zone("d", Team::Red, square(1.0, 4.0)).expect("propose red");
    engine.confirm_zone("d", Team::Red).expect("confirm red");
    engine.propose_zone("d", Team::Blue, square(6.0, 9.0)).expect("propose blue");
    engine.confirm_zone("d", Team::Blue).expect("confirm blue");
    engine.take_notifications();
    engine
}

fn ready_all(engine: &mut MatchPhaseEngine) {
    for id in ["d", "r", "b"] {
        engine.mark_player_ready(id).expect("ready");
    }
}

#[test]
fn only_the_director_can_define_the_sector_in_sector_definition() {
    let mut engine = three_player_match();
    assert!(engine.can_define_sector("d"));
    assert!(!engine.can_define_sector("r"));
    assert!(!engine.can_define_sector("ghost"));
    assert!(!engine.can_define_zones("d"));

    engine.propose_sector("d", square(0.0, 10.0)).expect("propose");
    engine.confirm_sector("d").expect("confirm");
    assert!(!engine.can_define_sector("d"));
    assert!(engine.can_define_zones("d"));
    assert!(!engine.can_define_zones("b"));
}

#[test]
fn participant_sector_proposal_is_rejected_without_side_effects() {
    let mut engine = three_player_match();
    let before = engine.state().clone();

    let result = engine.propose_sector("r", square(0.0, 10.0));

    assert!(matches!(
        result,
        Err(MatchError::Permission(PermissionDenied::NotDirector(_)))
    ));
    assert_eq!(engine.state(), &before);
    assert!(engine.take_notifications().is_empty());
}

#[test]
fn degenerate_sector_is_rejected() {
    let mut engine = three_player_match();
    let line = Polygon::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]);
    assert_eq!(
        engine.propose_sector("d", line),
        Err(MatchError::Validation(ValidationError::TooFewPoints(2)))
    );
    assert!(engine.state().sector.is_none());
}

#[test]
fn confirming_the_sector_moves_to_zone_definition_once() {
    let mut engine = three_player_match();
    engine.propose_sector("d", square(0.0, 10.0)).expect("propose");
    engine.propose_sector("d", square(0.0, 12.0)).expect("re-propose");
    engine.take_notifications();

    let events = engine.confirm_sector("d").expect("confirm");
    assert_eq!(events.len(), 1);
    match &events[0] {
        MatchEvent::ConfirmSector(confirm) => {
            assert!(confirm.cambiar_fase);
            assert_eq!(confirm.polygon, square(0.0, 12.0));
            assert_eq!(confirm.bounds.north, 12.0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(engine.phase(), (Phase::Preparation, SubPhase::ZoneDefinition));
    assert!(engine
        .take_notifications()
        .contains(&Notification::PhaseChanged {
            phase: Phase::Preparation,
            sub_phase: SubPhase::ZoneDefinition,
        }));

    let confirmed = engine.state().clone();
    assert_eq!(engine.confirm_sector("d"), Ok(Vec::new()));
    assert_eq!(engine.state(), &confirmed);
    assert!(engine.take_notifications().is_empty());

    assert!(engine.propose_sector("d", square(0.0, 5.0)).is_err());
    assert_eq!(engine.state().sector.as_ref().map(|s| &s.polygon), Some(&square(0.0, 12.0)));
}

#[test]
fn confirm_without_proposal_is_a_validation_error() {
    let mut engine = three_player_match();
    assert_eq!(
        engine.confirm_sector("d"),
        Err(MatchError::Validation(ValidationError::NoSectorProposed))
    );
}

#[test]
fn blue_zone_requires_confirmed_red_zone() {
    let mut engine = three_player_match();
    engine.propose_sector("d", square(0.0, 10.0)).expect("propose");
    engine.confirm_sector("d").expect("confirm");

    assert_eq!(
        engine.propose_zone("d", Team::Blue, square(6.0, 9.0)),
        Err(MatchError::Validation(ValidationError::ZoneOrdering))
    );
    assert!(matches!(
        engine.propose_zone("b", Team::Blue, square(6.0, 9.0)),
        Err(MatchError::Permission(_))
    ));
    assert!(engine.state().zones.is_empty());

    engine.propose_zone("d", Team::Red, square(1.0, 4.0)).expect("red");
    assert_eq!(
        engine.propose_zone("d", Team::Blue, square(6.0, 9.0)),
        Err(MatchError::Validation(ValidationError::ZoneOrdering))
    );
    engine.confirm_zone("d", Team::Red).expect("confirm red");
    engine.propose_zone("d", Team::Blue, square(6.0, 9.0)).expect("blue");
}

#[test]
fn zones_must_lie_within_the_sector() {
    let mut engine = three_player_match();
    engine.propose_sector("d", square(0.0, 10.0)).expect("propose");
    engine.confirm_sector("d").expect("confirm");

    let result = engine.propose_zone("d", Team::Red, square(5.0, 15.0));
    assert!(matches!(
        result,
        Err(MatchError::Validation(ValidationError::ZoneOutsideSector { team: Team::Red, .. }))
    ));
    assert!(engine.state().zone(Team::Red).is_none());
}

#[test]
fn confirming_blue_zone_enters_deployment() {
    let mut engine = three_player_match();
    engine.propose_sector("d", square(0.0, 10.0)).expect("propose");
    engine.confirm_sector("d").expect("confirm");
    engine.propose_zone("d", Team::Red, square(1.0, 4.0)).expect("red");
    engine.confirm_zone("d", Team::Red).expect("confirm red");
    assert_eq!(engine.phase().1, SubPhase::ZoneDefinition);
    assert!(matches!(
        engine.propose_zone("d", Team::Red, square(1.0, 5.0)),
        Err(MatchError::Validation(ValidationError::ZoneAlreadyConfirmed(Team::Red)))
    ));

    engine.propose_zone("d", Team::Blue, square(6.0, 9.0)).expect("blue");
    let events = engine.confirm_zone("d", Team::Blue).expect("confirm blue");
    match &events[..] {
        [MatchEvent::ConfirmZone(confirm)] => {
            assert_eq!(confirm.zone.team, Team::Blue);
            assert_eq!(confirm.zone.style.color, "#1976d2");
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(engine.phase(), (Phase::Preparation, SubPhase::Deployment));
    assert_eq!(engine.confirm_zone("d", Team::Blue), Ok(Vec::new()));
}

#[test]
fn all_players_ready_ignores_unassigned_players() {
    let mut engine = MatchPhaseEngine::with_players(
        "m1",
        vec![
            player("d", Team::Blue, Role::Director),
            player("spectator", Team::None, Role::Participant),
        ],
    );
    assert!(!engine.all_players_ready());

    let empty = MatchPhaseEngine::with_players(
        "m2",
        vec![player("spectator", Team::None, Role::Participant)],
    );
    assert!(!empty.all_players_ready());

    engine.state.players[0].ready = true;
    assert!(engine.all_players_ready());
}

#[test]
fn readiness_is_rejected_before_deployment() {
    let mut engine = three_player_match();
    assert!(matches!(
        engine.mark_player_ready("r"),
        Err(MatchError::Permission(PermissionDenied::WrongPhase { .. }))
    ));
    assert!(matches!(
        engine.mark_player_ready("ghost"),
        Err(MatchError::Permission(PermissionDenied::UnknownPlayer(_)))
    ));
}

#[test]
fn all_ready_in_deployment_starts_combat_turn_one() {
    let mut engine = engine_in_deployment();

    engine.mark_player_ready("d").expect("ready");
    engine.mark_player_ready("r").expect("ready");
    assert_eq!(engine.mark_player_ready("r"), Ok(Vec::new()));
    assert_eq!(engine.phase().1, SubPhase::Deployment);

    let events = engine.mark_player_ready("b").expect("ready");
    match &events[..] {
        [MatchEvent::ReadyState(ready)] => {
            assert_eq!(ready.sub_phase, SubPhase::Deployment);
            assert_eq!(ready.turn, 0);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(engine.phase(), (Phase::Combat, SubPhase::Movement));
    assert_eq!(engine.state().turn.turn, 1);
    assert!(engine.state().players.iter().all(|p| !p.ready));
}

#[test]
fn combat_alternates_movement_and_engagement_per_turn() {
    let mut engine = engine_in_deployment();
    ready_all(&mut engine);
    assert_eq!(engine.phase().1, SubPhase::Movement);

    ready_all(&mut engine);
    assert_eq!(engine.phase(), (Phase::Combat, SubPhase::Engagement));
    assert_eq!(engine.state().turn.turn, 1);

    ready_all(&mut engine);
    assert_eq!(engine.phase(), (Phase::Combat, SubPhase::Movement));
    assert_eq!(engine.state().turn.turn, 2);
}

#[test]
fn late_ready_echo_does_not_leak_into_the_next_stage() {
    let mut engine = engine_in_deployment();
    ready_all(&mut engine);
    assert_eq!(engine.phase().1, SubPhase::Movement);

    engine.apply_remote(&MatchEvent::ReadyState(ReadyState {
        match_id: "m1".to_string(),
        player_id: "r".to_string(),
        ready: true,
        phase: Phase::Preparation,
        sub_phase: SubPhase::Deployment,
        turn: 0,
        timestamp: Some(5),
    }));
    assert!(!engine.state().player("r").map(|p| p.ready).unwrap_or(true));

    let stale = ReadyState {
        match_id: "m1".to_string(),
        player_id: "r".to_string(),
        ready: true,
        phase: Phase::Preparation,
        sub_phase: SubPhase::Deployment,
        turn: 0,
        timestamp: None,
    };
    assert_eq!(
        engine.accept_ready("r", &stale),
        Err(MatchError::Validation(ValidationError::StaleStage))
    );
    assert!(matches!(
        engine.accept_ready("d", &stale),
        Err(MatchError::Permission(PermissionDenied::ActingForOther { .. }))
    ));
}

#[test]
fn remote_confirm_without_phase_flag_only_updates_geometry() {
    let mut engine = three_player_match();
    let mut confirm = ConfirmSector {
        match_id: "m1".to_string(),
        polygon: square(0.0, 10.0),
        bounds: crate::geometry::bounds_of(&square(0.0, 10.0)),
        cambiar_fase: false,
        timestamp: Some(10),
    };

    engine.apply_remote(&MatchEvent::ConfirmSector(confirm.clone()));
    assert_eq!(engine.phase().1, SubPhase::SectorDefinition);
    assert!(!engine.state().is_sector_confirmed());
    assert_eq!(engine.state().last_update_timestamp, 10);

    confirm.cambiar_fase = true;
    confirm.timestamp = Some(11);
    engine.apply_remote(&MatchEvent::ConfirmSector(confirm));
    assert_eq!(engine.phase().1, SubPhase::ZoneDefinition);
    assert!(engine.state().is_sector_confirmed());
}

#[test]
fn restore_discards_unconfirmed_local_geometry() {
    let mut authority = three_player_match();
    authority.propose_sector("d", square(0.0, 10.0)).expect("propose");
    authority.confirm_sector("d").expect("confirm");

    let mut client = authority.clone();
    client.propose_zone("d", Team::Red, square(1.0, 4.0)).expect("local red");
    client.take_notifications();

    // The authority never saw the red proposal, so the snapshot has no zones.
    let snapshot = authority.snapshot_for("d", 42);
    client.restore(snapshot);

    assert!(client.state().zones.is_empty());
    assert_eq!(client.state().last_update_timestamp, 42);
    assert!(client.take_notifications().contains(&Notification::ZoneUpdated {
        team: Team::Red,
        polygon: None,
        confirmed: false,
    }));
}

#[test]
fn snapshot_hides_provisional_geometry_from_other_players() {
    let mut engine = three_player_match();
    engine.propose_sector("d", square(0.0, 10.0)).expect("propose");

    assert!(engine.snapshot_for("d", 1).sector.is_some());
    assert!(engine.snapshot_for("r", 1).sector.is_none());

    engine.confirm_sector("d").expect("confirm");
    assert!(engine.snapshot_for("r", 2).sector.is_some());
}

#[test]
fn participants_see_opposing_zone_at_zero_opacity() {
    let engine = engine_in_deployment();

    let red_view = engine.layer_visibility("r");
    assert!(red_view.contains(&LayerVisibility {
        layer: Layer::Zone(Team::Red),
        opacity: 1.0,
    }));
    assert!(red_view.contains(&LayerVisibility {
        layer: Layer::Zone(Team::Blue),
        opacity: 0.0,
    }));

    let director_view = engine.layer_visibility("d");
    assert_eq!(director_view.len(), 3);
    assert!(director_view.iter().all(|layer| layer.opacity == 1.0));
}

#[test]
fn designated_director_replaces_temporary_one_during_setup() {
    let mut engine = MatchPhaseEngine::new("m1");
    let join = |id: &str, team: Option<Team>, role: Option<Role>| JoinMatch {
        match_id: "m1".to_string(),
        player_id: id.to_string(),
        display_name: id.to_string(),
        team,
        role,
        timestamp: None,
    };

    engine.join_player(&join("a", Some(Team::Blue), None));
    assert_eq!(engine.director(), Some("a"));
    assert!(engine.state().is_temporary_director);

    engine.join_player(&join("b", Some(Team::Red), Some(Role::Director)));
    assert_eq!(engine.director(), Some("b"));
    assert!(!engine.state().is_temporary_director);

    let joined = engine.join_player(&join("c", None, Some(Role::Director)));
    assert_eq!(joined.team, Team::Red);
    assert_eq!(engine.director(), Some("b"));
}

#[test]
fn director_leaving_elects_a_temporary_replacement() {
    let mut engine = three_player_match();
    assert!(!engine.director_left("r"));
    assert_eq!(engine.director(), Some("d"));

    assert!(engine.director_left("d"));
    assert_eq!(engine.director(), Some("b"));
    assert!(engine.state().is_temporary_director);
    assert_eq!(
        engine.state().player("b").map(|p| p.role),
        Some(Role::Director)
    );
}
