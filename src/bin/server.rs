use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wargame_coordinator::authority::{MatchAuthority, Outbound};
use wargame_coordinator::config::CoordinatorConfig;
use wargame_coordinator::constants::OUTBOUND_CHANNEL_CAPACITY;
use wargame_coordinator::protocol::{events, parse_frame, WireFrame};
use wargame_coordinator::utils::{normalize_match_id, normalize_player_id};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type SharedState = Arc<Mutex<ServerState>>;

#[derive(Clone)]
struct ClientContext {
    tx: mpsc::Sender<OutboundMessage>,
    match_id: String,
    player_id: String,
}

#[derive(Clone, Debug)]
enum OutboundMessage {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueuePolicy {
    DropOnFull,
    DisconnectOnFull,
}

#[derive(Default)]
struct ServerState {
    clients: HashMap<String, ClientContext>,
    active_client_by_player: HashMap<(String, String), String>,
    matches: HashMap<String, MatchAuthority>,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "matchId")]
    match_id: Option<String>,
    #[serde(rename = "playerId")]
    player_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoordinatorConfig::from_env();
    let state: SharedState = Arc::new(Mutex::new(ServerState::default()));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let app = if let Some(static_dir) = resolve_static_dir() {
        let index_file = static_dir.join("index.html");
        info!(root = %static_dir.to_string_lossy(), "serving map client");
        app.fallback_service(ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)))
    } else {
        app
    };

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%bind_addr, %error, "failed to bind server socket");
            std::process::exit(1);
        }
    };

    info!(port = config.port, "match authority listening");
    if let Err(error) = axum::serve(listener, app).await {
        tracing::error!(%error, "server runtime failed");
        std::process::exit(1);
    }
}

fn resolve_static_dir() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var("STATIC_DIR").ok()?);
    path.join("index.html").is_file().then_some(path)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<SharedState>,
) -> Response {
    let Some((match_id, player_id)) = parse_connect_query(&query) else {
        return (StatusCode::BAD_REQUEST, "matchId and playerId are required").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, match_id, player_id))
}

fn parse_connect_query(query: &ConnectQuery) -> Option<(String, String)> {
    let match_id = normalize_match_id(query.match_id.as_deref())?;
    let player_id = normalize_player_id(query.player_id.as_deref())?;
    Some((match_id, player_id))
}

async fn handle_socket(state: SharedState, socket: WebSocket, match_id: String, player_id: String) {
    let client_id = make_id("client");
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CHANNEL_CAPACITY);

    {
        let mut guard = state.lock().await;
        bind_client(&mut guard, &client_id, &match_id, &player_id, tx.clone());
    }
    info!(%client_id, %match_id, %player_id, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let should_close = matches!(outbound, OutboundMessage::Close { .. });
            let result = match outbound {
                OutboundMessage::Text(payload) => ws_sender.send(Message::Text(payload.into())).await,
                OutboundMessage::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    ws_sender.send(Message::Close(Some(frame))).await
                }
            };
            if result.is_err() || should_close {
                break;
            }
        }
    });

    while let Some(received) = ws_receiver.next().await {
        let Ok(message) = received else {
            break;
        };

        match message {
            Message::Text(raw) => {
                handle_client_message(&state, &client_id, raw.as_str()).await;
            }
            Message::Binary(raw) => match std::str::from_utf8(&raw) {
                Ok(text) => handle_client_message(&state, &client_id, text).await,
                Err(_) => warn!(%client_id, "dropping non-utf8 frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    {
        let mut guard = state.lock().await;
        disconnect_client_internal(&mut guard, &client_id);
    }
    drop(tx);
    let _ = writer.await;
    info!(%client_id, "client disconnected");
}

/// A newer connection for the same player replaces the older one.
fn bind_client(
    state: &mut ServerState,
    client_id: &str,
    match_id: &str,
    player_id: &str,
    tx: mpsc::Sender<OutboundMessage>,
) {
    state
        .matches
        .entry(match_id.to_string())
        .or_insert_with(|| MatchAuthority::new(match_id));
    state.clients.insert(
        client_id.to_string(),
        ClientContext {
            tx,
            match_id: match_id.to_string(),
            player_id: player_id.to_string(),
        },
    );
    let previous = state
        .active_client_by_player
        .insert((match_id.to_string(), player_id.to_string()), client_id.to_string());
    if let Some(previous) = previous.filter(|previous| previous != client_id) {
        if let Some(old) = state.clients.remove(&previous) {
            debug!(%previous, client_id, "replacing older connection");
            let _ = old.tx.try_send(OutboundMessage::Close {
                code: 4000,
                reason: "replaced by a newer connection".to_string(),
            });
        }
    }
}

async fn handle_client_message(state: &SharedState, client_id: &str, raw: &str) {
    let frame = match parse_frame(raw) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(client_id, %error, "invalid frame");
            return;
        }
    };

    let mut guard = state.lock().await;
    let Some(context) = guard.clients.get(client_id).cloned() else {
        return;
    };
    let Some(authority) = guard.matches.get_mut(&context.match_id) else {
        return;
    };
    let policy = frame
        .event_name()
        .map(policy_for_event)
        .unwrap_or(QueuePolicy::DisconnectOnFull);
    let outcome = authority.handle(&context.player_id, frame);

    if let Some(reply) = outcome.reply {
        send_to_client(&mut guard, client_id, &reply, QueuePolicy::DisconnectOnFull);
    }
    broadcast(&mut guard, &context.match_id, outcome.broadcasts, policy);
}

/// Relayed traffic is best effort; losing a state update would leave the
/// client diverged, so a full queue there drops the client instead.
fn policy_for_event(event: &str) -> QueuePolicy {
    match event {
        events::CHAT_MESSAGE | events::REPORT | events::POSITION_UPDATE | events::HEARTBEAT => {
            QueuePolicy::DropOnFull
        }
        _ => QueuePolicy::DisconnectOnFull,
    }
}

fn disconnect_client_internal(state: &mut ServerState, client_id: &str) {
    let Some(context) = state.clients.remove(client_id) else {
        return;
    };
    let key = (context.match_id.clone(), context.player_id.clone());
    if state
        .active_client_by_player
        .get(&key)
        .map(|active| active != client_id)
        .unwrap_or(true)
    {
        return;
    }
    state.active_client_by_player.remove(&key);

    let Some(authority) = state.matches.get_mut(&context.match_id) else {
        return;
    };
    let outbound = authority.player_disconnected(&context.player_id);
    broadcast(state, &context.match_id, outbound, QueuePolicy::DropOnFull);
}

fn send_to_client(state: &mut ServerState, client_id: &str, frame: &WireFrame, policy: QueuePolicy) {
    let Ok(text) = serde_json::to_string(frame) else {
        warn!(client_id, "failed to encode frame");
        return;
    };
    let send_failed = state
        .clients
        .get(client_id)
        .map(|client| client.tx.try_send(OutboundMessage::Text(text)).is_err())
        .unwrap_or(false);
    if send_failed && policy == QueuePolicy::DisconnectOnFull {
        warn!(client_id, "outbound queue full; disconnecting");
        disconnect_client_internal(state, client_id);
    }
}

fn broadcast(state: &mut ServerState, match_id: &str, outbound: Vec<Outbound>, policy: QueuePolicy) {
    let mut failed_clients = Vec::new();
    for Outbound { audience, frame } in outbound {
        let Ok(payload) = serde_json::to_string(&frame) else {
            warn!(match_id, "failed to encode broadcast");
            continue;
        };
        for (client_id, client) in &state.clients {
            if !can_receive_broadcast(state, match_id, client_id, client) || !audience.includes(&client.player_id) {
                continue;
            }
            if client
                .tx
                .try_send(OutboundMessage::Text(payload.clone()))
                .is_err()
                && policy == QueuePolicy::DisconnectOnFull
            {
                failed_clients.push(client_id.clone());
            }
        }
    }
    for client_id in failed_clients {
        warn!(%client_id, "outbound queue full; disconnecting");
        disconnect_client_internal(state, &client_id);
    }
}

fn can_receive_broadcast(state: &ServerState, match_id: &str, client_id: &str, client: &ClientContext) -> bool {
    if client.match_id != match_id {
        return false;
    }
    state
        .active_client_by_player
        .get(&(client.match_id.clone(), client.player_id.clone()))
        .map(|active| active == client_id)
        .unwrap_or(false)
}

fn make_id(prefix: &str) -> String {
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{seq}")
}
