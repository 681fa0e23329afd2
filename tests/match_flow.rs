use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wargame_coordinator::config::CoordinatorConfig;
use wargame_coordinator::connection::loopback::{LoopbackConnector, LoopbackHub};
use wargame_coordinator::connection::queue::EventClass;
use wargame_coordinator::error::{ConnectionError, HandlerError, SessionError};
use wargame_coordinator::observer::MatchObserver;
use wargame_coordinator::protocol::{events, WireFrame};
use wargame_coordinator::router::{EventHandler, ModuleSpec};
use wargame_coordinator::session::{Delivery, MatchSession};
use wargame_coordinator::types::{
    Identity, MatchContext, Phase, Point, Polygon, Role, SubPhase, Team,
};

const MATCH_ID: &str = "m1";
const IDLE: Duration = Duration::from_millis(30);

type Session = MatchSession<LoopbackConnector>;

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        send_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(10),
        reconnect_min_interval: Duration::from_millis(5),
        reconnect_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(60),
        snapshot_timeout: Duration::from_secs(1),
        ..CoordinatorConfig::default()
    }
}

fn session(hub: &LoopbackHub, player_id: &str, role: Role, team: Option<Team>, config: CoordinatorConfig) -> Session {
    MatchSession::new(
        hub.connector(),
        Identity {
            player_id: player_id.to_string(),
            display_name: player_id.to_uppercase(),
            team,
            role: Some(role),
        },
        MatchContext {
            match_id: MATCH_ID.to_string(),
        },
        config,
    )
}

fn square(min: f64, max: f64) -> Polygon {
    Polygon::new(vec![
        Point::new(min, min),
        Point::new(min, max),
        Point::new(max, max),
        Point::new(max, min),
    ])
}

/// Director "d" on Blue and participant "p" (auto-assigned Red), both joined.
async fn two_player_match(hub: &LoopbackHub, config: CoordinatorConfig) -> (Session, Session) {
    let mut director = session(hub, "d", Role::Director, Some(Team::Blue), config.clone());
    let mut participant = session(hub, "p", Role::Participant, None, config);
    director.connect().await.expect("director connects");
    participant.connect().await.expect("participant connects");
    settle(&mut [&mut director, &mut participant]).await;
    (director, participant)
}

async fn settle(sessions: &mut [&mut Session]) {
    for session in sessions.iter_mut() {
        session.process_until_idle(IDLE).await;
    }
}

async fn define_battlefield(director: &mut Session) {
    director.propose_sector(square(0.0, 10.0)).await.expect("sector proposed");
    director.confirm_sector().await.expect("sector confirmed");
    director.propose_zone(Team::Red, square(1.0, 4.0)).await.expect("red proposed");
    director.confirm_zone(Team::Red).await.expect("red confirmed");
    director.propose_zone(Team::Blue, square(6.0, 9.0)).await.expect("blue proposed");
    director.confirm_zone(Team::Blue).await.expect("blue confirmed");
}

#[derive(Default)]
struct SectorCounter {
    confirmed: AtomicUsize,
}

impl MatchObserver for SectorCounter {
    fn on_sector_updated(&self, _polygon: Option<&Polygon>, confirmed: bool) -> Result<(), HandlerError> {
        if confirmed {
            self.confirmed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[tokio::test]
async fn full_flow_reaches_the_first_combat_turn() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, mut participant) = two_player_match(&hub, test_config()).await;
    assert_eq!(participant.identity().team, Some(Team::Red));

    define_battlefield(&mut director).await;
    settle(&mut [&mut director, &mut participant]).await;
    assert_eq!(participant.engine().phase(), (Phase::Preparation, SubPhase::Deployment));

    director.mark_ready().await.expect("director ready");
    settle(&mut [&mut director, &mut participant]).await;
    assert_eq!(participant.engine().phase().1, SubPhase::Deployment);

    participant.mark_ready().await.expect("participant ready");
    settle(&mut [&mut director, &mut participant]).await;

    let authority = hub.authority_state();
    assert_eq!((authority.phase, authority.sub_phase), (Phase::Combat, SubPhase::Movement));
    assert_eq!(authority.turn.turn, 1);
    for session in [&director, &participant] {
        assert_eq!(session.engine().phase(), (Phase::Combat, SubPhase::Movement));
        assert_eq!(session.state().turn.turn, 1);
        assert!(session.state().players.iter().all(|player| !player.ready));
    }
}

#[tokio::test]
async fn sector_confirmation_reaches_participants_once() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, mut participant) = two_player_match(&hub, test_config()).await;
    let counter = Arc::new(SectorCounter::default());
    assert!(participant.subscribe(counter.clone()));

    director.propose_sector(square(0.0, 10.0)).await.expect("proposed");
    settle(&mut [&mut participant]).await;
    assert!(participant.state().sector.is_none());

    assert_eq!(director.confirm_sector().await.expect("confirmed"), Delivery::Sent);
    assert_eq!(director.confirm_sector().await.expect("repeat is a no-op"), Delivery::Unchanged);
    settle(&mut [&mut director, &mut participant]).await;

    assert_eq!(hub.sent_count("d", events::CONFIRM_SECTOR), 1);
    assert_eq!(counter.confirmed.load(Ordering::SeqCst), 1);
    assert_eq!(participant.engine().phase().1, SubPhase::ZoneDefinition);
}

#[tokio::test]
async fn offline_positions_coalesce_and_chat_is_kept() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, mut participant) = two_player_match(&hub, test_config()).await;

    hub.set_offline("p", true);
    settle(&mut [&mut participant]).await;
    assert!(!participant.is_connected());

    for step in 0..3 {
        let delivery = participant
            .report_position(Point::new(1.0 + f64::from(step), 2.0))
            .await
            .expect("queued");
        assert_eq!(delivery, Delivery::Queued(EventClass::Position));
    }
    assert_eq!(
        participant.send_chat("holding the ridge").await.expect("queued"),
        Delivery::Queued(EventClass::Message)
    );
    assert_eq!(participant.connection().pending_len(EventClass::Position), 1);

    hub.set_offline("p", false);
    participant.recover().await.expect("reconnects");
    settle(&mut [&mut director, &mut participant]).await;

    assert!(participant.is_connected());
    assert_eq!(hub.sent_count("p", events::POSITION_UPDATE), 1);
    assert_eq!(hub.sent_count("p", events::CHAT_MESSAGE), 1);
    assert_eq!(participant.connection().pending_len(EventClass::Position), 0);
}

#[tokio::test]
async fn retryable_failures_stop_after_three_attempts() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, _participant) = two_player_match(&hub, test_config()).await;

    hub.fail_next(events::PROPOSE_SECTOR, 10);
    let result = director.propose_sector(square(0.0, 10.0)).await;

    assert!(matches!(
        result,
        Err(SessionError::Connection(ConnectionError::RetriesExhausted { attempts: 3, .. }))
    ));
    assert_eq!(hub.sent_count("d", events::PROPOSE_SECTOR), 3);
}

#[tokio::test]
async fn stalled_acknowledgement_times_out() {
    let hub = LoopbackHub::new(MATCH_ID);
    let config = CoordinatorConfig {
        send_timeout: Duration::from_millis(150),
        ..test_config()
    };
    let (mut director, _participant) = two_player_match(&hub, config).await;

    hub.stall_acks(true);
    let result = director.propose_sector(square(0.0, 10.0)).await;

    assert!(matches!(
        result,
        Err(SessionError::Connection(ConnectionError::Timeout { .. }))
    ));
    assert_eq!(hub.sent_count("d", events::PROPOSE_SECTOR), 1);
}

#[tokio::test]
async fn reconnect_restores_state_missed_while_offline() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, mut participant) = two_player_match(&hub, test_config()).await;

    hub.set_offline("p", true);
    settle(&mut [&mut participant]).await;
    define_battlefield(&mut director).await;
    assert_eq!(participant.engine().phase().1, SubPhase::SectorDefinition);

    hub.set_offline("p", false);
    participant.recover().await.expect("reconnects");

    assert_eq!(participant.engine().phase(), (Phase::Preparation, SubPhase::Deployment));
    assert!(participant.state().is_sector_confirmed());
    assert!(participant.state().is_zone_confirmed(Team::Red));
    assert!(participant.state().is_zone_confirmed(Team::Blue));
}

#[tokio::test]
async fn director_loss_promotes_a_temporary_director() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (director, mut participant) = two_player_match(&hub, test_config()).await;
    assert_eq!(participant.engine().director(), Some("d"));

    hub.drop_link(director.identity().player_id.as_str());
    settle(&mut [&mut participant]).await;

    assert_eq!(participant.engine().director(), Some("p"));
    assert!(participant.state().is_temporary_director);
    assert!(participant.engine().can_define_sector("p"));
}

#[tokio::test]
async fn handlers_register_once_and_receive_relayed_events() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, mut participant) = two_player_match(&hub, test_config()).await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let handler: EventHandler = Arc::new(move |data: &Value| {
        assert_eq!(data.get("text"), Some(&json!("contact north")));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(participant.on(events::CHAT_MESSAGE, handler.clone()));
    assert!(!participant.on(events::CHAT_MESSAGE, handler));

    director.send_chat("contact north").await.expect("chat sent");
    settle(&mut [&mut participant]).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    assert_eq!(participant.off(events::CHAT_MESSAGE), 1);
    director.send_chat("contact north").await.expect("chat sent");
    settle(&mut [&mut participant]).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn modules_get_reconnect_hooks() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (_director, mut participant) = two_player_match(&hub, test_config()).await;

    let connects = Arc::new(AtomicUsize::new(0));
    let reconnects = Arc::new(AtomicUsize::new(0));
    let (on_connect, on_reconnect) = (connects.clone(), reconnects.clone());
    let module = ModuleSpec::default()
        .on_connect(Arc::new(move || {
            on_connect.fetch_add(1, Ordering::SeqCst);
        }))
        .on_reconnect(Arc::new(move || {
            on_reconnect.fetch_add(1, Ordering::SeqCst);
        }));
    assert!(participant.register_module("radio", module.clone()));
    assert!(!participant.register_module("radio", module));
    // Already connected, so the connect hook fires right away.
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    hub.drop_link("p");
    settle(&mut [&mut participant]).await;
    participant.recover().await.expect("reconnects");
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);

    assert!(participant.unregister_module("radio"));
    assert!(!participant.unregister_module("radio"));
}

#[tokio::test]
async fn second_connect_is_refused() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, _participant) = two_player_match(&hub, test_config()).await;

    assert!(matches!(
        director.connect().await,
        Err(SessionError::Connection(ConnectionError::SessionExists))
    ));
}

#[tokio::test]
async fn exhausted_confirmation_falls_back_to_the_authority_view() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, _participant) = two_player_match(&hub, test_config()).await;
    director.propose_sector(square(0.0, 10.0)).await.expect("proposed");

    hub.fail_next(events::CONFIRM_SECTOR, 10);
    let result = director.confirm_sector().await;
    assert!(matches!(
        result,
        Err(SessionError::Connection(ConnectionError::RetriesExhausted { .. }))
    ));
    assert_eq!(director.engine().phase().1, SubPhase::SectorDefinition);
    assert!(director.state().sector.is_some());
    assert!(!director.state().is_sector_confirmed());

    hub.fail_next(events::CONFIRM_SECTOR, 0);
    assert_eq!(director.confirm_sector().await.expect("confirmed"), Delivery::Sent);
    assert_eq!(hub.authority_state().sub_phase, SubPhase::ZoneDefinition);
}

#[tokio::test]
async fn restarted_client_receives_current_state() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (mut director, mut participant) = two_player_match(&hub, test_config()).await;

    hub.drop_link("p");
    participant.shutdown();
    settle(&mut [&mut director]).await;
    define_battlefield(&mut director).await;

    let mut restarted = session(&hub, "p", Role::Participant, None, test_config());
    restarted.connect().await.expect("restarted client connects");

    assert_eq!(restarted.engine().phase(), (Phase::Preparation, SubPhase::Deployment));
    assert!(restarted.state().is_zone_confirmed(Team::Red));
    assert_eq!(restarted.identity().team, Some(Team::Red));
    let rejoined = hub.authority_state();
    assert!(rejoined.player("p").is_some_and(|player| player.connected));
}

#[tokio::test]
async fn heartbeats_carry_the_team_assigned_on_join() {
    let hub = LoopbackHub::new(MATCH_ID);
    let (_director, participant) = two_player_match(&hub, test_config()).await;
    assert_eq!(participant.identity().team, Some(Team::Red));

    let beat = hub
        .frames_from("p")
        .into_iter()
        .find_map(|frame| match frame {
            WireFrame::Emit { event, data, .. } if event == events::HEARTBEAT => Some(data),
            _ => None,
        })
        .expect("heartbeat sent");
    assert_eq!(beat["team"], json!("red"));
}
