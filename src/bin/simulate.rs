use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wargame_coordinator::config::CoordinatorConfig;
use wargame_coordinator::connection::loopback::{LoopbackConnector, LoopbackHub};
use wargame_coordinator::error::SessionError;
use wargame_coordinator::protocol::events;
use wargame_coordinator::session::{Delivery, MatchSession};
use wargame_coordinator::types::{
    Identity, MatchContext, Phase, Point, Polygon, Role, SubPhase, Team,
};
use wargame_coordinator::utils::now_ms;

const SECTOR_SPAN_DEG: f64 = 0.02;
const POSITION_STEPS: usize = 6;
const IDLE: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Players in the match, the director included
    #[arg(long, default_value_t = 4)]
    players: usize,
    /// Drop one participant's link after this many position reports
    #[arg(long)]
    drop_after: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    match_id: Option<String>,
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
struct RunSummary {
    #[serde(rename = "matchId")]
    match_id: String,
    seed: u64,
    players: usize,
    phase: Phase,
    #[serde(rename = "subPhase")]
    sub_phase: SubPhase,
    turn: u32,
    director: Option<String>,
    #[serde(rename = "positionsSent")]
    positions_sent: usize,
    #[serde(rename = "queuedWhileOffline")]
    queued_while_offline: usize,
    #[serde(rename = "durationMs")]
    duration_ms: u64,
    anomalies: Vec<String>,
}

type Session = MatchSession<LoopbackConnector>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let seed = cli.seed.unwrap_or_else(|| rand::rng().random());
    let started_at_ms = now_ms();
    let match_id = cli
        .match_id
        .clone()
        .unwrap_or_else(|| default_match_id(seed, started_at_ms));

    let summary = match run_match(&cli, &match_id, seed).await {
        Ok(summary) => summary,
        Err(error) => {
            tracing::error!(%match_id, %error, "simulation aborted");
            std::process::exit(2);
        }
    };

    match serde_json::to_string(&summary) {
        Ok(line) => println!("{line}"),
        Err(error) => warn!(%error, "failed to encode summary"),
    }
    if let Some(path) = cli.summary_out.as_ref() {
        if let Err(error) = write_summary(path, &summary) {
            tracing::error!(path = %path.to_string_lossy(), %error, "failed to write summary");
            std::process::exit(2);
        }
    }
    if !summary.anomalies.is_empty() {
        std::process::exit(1);
    }
}

async fn run_match(cli: &Cli, match_id: &str, seed: u64) -> Result<RunSummary, SessionError> {
    let started_at_ms = now_ms();
    let mut rng = StdRng::seed_from_u64(seed);
    let hub = LoopbackHub::new(match_id);
    let config = simulation_config();
    let player_count = cli.players.max(2);

    let mut sessions: Vec<Session> = (0..player_count)
        .map(|index| {
            MatchSession::new(
                hub.connector(),
                simulated_identity(index),
                MatchContext {
                    match_id: match_id.to_string(),
                },
                config.clone(),
            )
        })
        .collect();

    for index in 0..sessions.len() {
        sessions[index].connect().await?;
        pump(&mut sessions).await;
    }
    info!(match_id, players = player_count, "all players joined");

    let origin = Point::new(rng.random_range(-60.0..60.0), rng.random_range(-150.0..150.0));
    let director = &mut sessions[0];
    director.propose_sector(square(origin, 0.0, SECTOR_SPAN_DEG)).await?;
    director.confirm_sector().await?;
    director
        .propose_zone(Team::Red, square(origin, 0.002, 0.008))
        .await?;
    director.confirm_zone(Team::Red).await?;
    director
        .propose_zone(Team::Blue, square(origin, 0.012, 0.018))
        .await?;
    director.confirm_zone(Team::Blue).await?;
    pump(&mut sessions).await;

    // Deployment -> Movement (turn 1)
    ready_round(&mut sessions).await?;

    let mut positions_sent = 0;
    let mut queued_while_offline = 0;
    let dropped = player_count - 1;
    let dropped_id = sessions[dropped].identity().player_id.clone();
    let drop_step = cli.drop_after.filter(|step| *step < POSITION_STEPS);
    for step in 0..POSITION_STEPS {
        if drop_step == Some(step) {
            info!(player_id = %dropped_id, step, "dropping link");
            hub.drop_link(&dropped_id);
            pump(&mut sessions).await;
        }
        for session in sessions.iter_mut() {
            let position = Point::new(
                origin.lat + rng.random_range(0.0..SECTOR_SPAN_DEG),
                origin.lng + rng.random_range(0.0..SECTOR_SPAN_DEG),
            );
            match session.report_position(position).await? {
                Delivery::Queued(_) => queued_while_offline += 1,
                _ => positions_sent += 1,
            }
        }
        pump(&mut sessions).await;
    }
    if drop_step.is_some() {
        sessions[dropped].recover().await?;
        pump(&mut sessions).await;
    }

    // Movement -> Engagement -> Movement (turn 2)
    ready_round(&mut sessions).await?;
    ready_round(&mut sessions).await?;

    let authority = hub.authority_state();
    let mut anomalies = Vec::new();
    for session in &sessions {
        let state = session.state();
        let player_id = &session.identity().player_id;
        if (state.phase, state.sub_phase) != (authority.phase, authority.sub_phase) {
            anomalies.push(format!(
                "{player_id} sees {:?}/{:?}, authority {:?}/{:?}",
                state.phase, state.sub_phase, authority.phase, authority.sub_phase
            ));
        }
        if state.turn.turn != authority.turn.turn {
            anomalies.push(format!(
                "{player_id} on turn {}, authority on {}",
                state.turn.turn, authority.turn.turn
            ));
        }
        if state.director != authority.director {
            anomalies.push(format!("{player_id} disagrees about the director"));
        }
    }
    if let Some(step) = drop_step {
        // Everything sent before the drop plus one coalesced position.
        let delivered = hub.sent_count(&dropped_id, events::POSITION_UPDATE);
        let expected = step + 1;
        if delivered != expected {
            anomalies.push(format!(
                "{dropped_id} delivered {delivered} positions, expected {expected}"
            ));
        }
    }
    for anomaly in &anomalies {
        warn!(match_id, %anomaly, "anomaly detected");
    }

    for session in sessions.iter_mut() {
        session.shutdown();
    }

    Ok(RunSummary {
        match_id: match_id.to_string(),
        seed,
        players: player_count,
        phase: authority.phase,
        sub_phase: authority.sub_phase,
        turn: authority.turn.turn,
        director: authority.director,
        positions_sent,
        queued_while_offline,
        duration_ms: now_ms().saturating_sub(started_at_ms),
        anomalies,
    })
}

async fn ready_round(sessions: &mut [Session]) -> Result<(), SessionError> {
    for index in 0..sessions.len() {
        sessions[index].mark_ready().await?;
        pump(sessions).await;
    }
    Ok(())
}

/// Lets every session drain its inbound broadcasts.
async fn pump(sessions: &mut [Session]) {
    for session in sessions.iter_mut() {
        session.process_until_idle(IDLE).await;
    }
}

fn simulation_config() -> CoordinatorConfig {
    CoordinatorConfig {
        send_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(50),
        reconnect_min_interval: Duration::from_millis(10),
        reconnect_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(60),
        snapshot_timeout: Duration::from_secs(2),
        ..CoordinatorConfig::default()
    }
}

fn simulated_identity(index: usize) -> Identity {
    let (role, team) = if index == 0 {
        (Some(Role::Director), Some(Team::Blue))
    } else {
        (Some(Role::Participant), None)
    };
    Identity {
        player_id: format!("player_{}", index + 1),
        display_name: format!("Player {}", index + 1),
        team,
        role,
    }
}

/// Axis-aligned square spanning `[from, to]` degrees from `origin` on both axes.
fn square(origin: Point, from: f64, to: f64) -> Polygon {
    Polygon::new(vec![
        Point::new(origin.lat + from, origin.lng + from),
        Point::new(origin.lat + from, origin.lng + to),
        Point::new(origin.lat + to, origin.lng + to),
        Point::new(origin.lat + to, origin.lng + from),
    ])
}

fn default_match_id(seed: u64, timestamp_ms: u64) -> String {
    format!("sim-{seed}-{timestamp_ms}")
}

fn write_summary(path: &Path, summary: &RunSummary) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}
