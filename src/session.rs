//! Per-match client context. Owns the connection, router, phase engine,
//! reconciler and observers, and runs every mutation on the caller's task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::connection::queue::EventClass;
use crate::connection::transport::Connector;
use crate::connection::{ConnectionManager, ConnectionOptions, LinkEvent, SendOptions};
use crate::engine::MatchPhaseEngine;
use crate::error::{ConnectionError, SessionError};
use crate::observer::{MatchObserver, ObserverHub};
use crate::protocol::{events, JoinAccepted, JoinMatch, MatchEvent, WireFrame};
use crate::reconcile::ReconciliationService;
use crate::router::{EventHandler, EventRouter, HandlerId, ModuleSpec};
use crate::types::{
    Identity, LayerVisibility, Match, MatchContext, Notification, Point, Polygon, Team,
};
use crate::utils::now_ms;

/// How an intent left the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The authority acknowledged it (or it needed no acknowledgement).
    Sent,
    /// The transport is down; the event waits in the given queue.
    Queued(EventClass),
    /// Nothing to send, e.g. confirming an already confirmed sector.
    Unchanged,
}

pub struct MatchSession<C: Connector> {
    identity: Identity,
    context: MatchContext,
    config: CoordinatorConfig,
    connection: ConnectionManager<C>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    router: EventRouter,
    engine: MatchPhaseEngine,
    reconciler: ReconciliationService,
    observers: ObserverHub,
    synced: bool,
}

impl<C: Connector> MatchSession<C> {
    pub fn new(connector: C, identity: Identity, context: MatchContext, config: CoordinatorConfig) -> Self {
        let (connection, link_events) = ConnectionManager::new(connector, ConnectionOptions::from(&config));
        for event in events::CORE {
            connection.register_event(event, HandlerId::CORE);
        }
        Self {
            engine: MatchPhaseEngine::new(context.match_id.clone()),
            router: EventRouter::new(config.dedupe_window),
            reconciler: ReconciliationService::new(config.snapshot_timeout),
            observers: ObserverHub::default(),
            identity,
            context,
            config,
            connection,
            link_events,
            synced: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn engine(&self) -> &MatchPhaseEngine {
        &self.engine
    }

    pub fn state(&self) -> &Match {
        self.engine.state()
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn layer_visibility(&self) -> Vec<LayerVisibility> {
        self.engine.layer_visibility(&self.identity.player_id)
    }

    /// Opens the session: join, flush anything queued, pull the snapshot and
    /// start the heartbeat.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.connection.has_session() {
            return Err(ConnectionError::SessionExists.into());
        }
        if !self
            .connection
            .initialize(self.identity.clone(), self.context.clone())
            .await
        {
            return Err(ConnectionError::NotConnected.into());
        }
        self.on_connected(false).await
    }

    /// One reconnect attempt. Resynchronizes when the link comes back after
    /// a loss. Returns false if the transport is still unavailable.
    pub async fn reconnect(&mut self) -> Result<bool, SessionError> {
        let was_connected = self.connection.is_connected();
        if !self.connection.reconnect().await {
            return Ok(false);
        }
        if !was_connected || !self.synced {
            self.on_connected(true).await?;
        }
        Ok(true)
    }

    /// Retries `reconnect` up to the configured attempt budget, pausing the
    /// minimum reconnect interval between attempts.
    pub async fn recover(&mut self) -> Result<(), SessionError> {
        let attempts = self.config.max_reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.reconnect().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(attempt, "reconnect attempt failed"),
                Err(error) => warn!(attempt, %error, "resynchronization failed"),
            }
            tokio::time::sleep(self.config.reconnect_min_interval).await;
        }
        Err(ConnectionError::RetriesExhausted {
            event: "reconnect".to_string(),
            attempts,
        }
        .into())
    }

    async fn on_connected(&mut self, reconnected: bool) -> Result<(), SessionError> {
        self.join().await?;
        let report = self.connection.flush_pending().await;
        if report.requeued > 0 {
            warn!(requeued = report.requeued, "connection lost again while flushing");
        }
        self.reconcile().await?;
        self.connection.start_heartbeat(self.config.heartbeat_interval);
        self.synced = true;

        self.router.set_connected(true);
        if reconnected {
            self.router.notify_reconnect();
        }
        self.observers
            .publish(&Notification::ConnectionStateChanged { connected: true });
        info!(
            match_id = %self.context.match_id,
            player_id = %self.identity.player_id,
            reconnected,
            "session synchronized"
        );
        Ok(())
    }

    async fn join(&mut self) -> Result<(), SessionError> {
        let join = JoinMatch {
            match_id: self.context.match_id.clone(),
            player_id: self.identity.player_id.clone(),
            display_name: self.identity.display_name.clone(),
            team: self.identity.team,
            role: self.identity.role,
            timestamp: None,
        };
        let options = SendOptions {
            queue_if_offline: false,
            ..self.connection.default_send_options()
        };
        let reply = self
            .connection
            .send(events::JOIN_MATCH, MatchEvent::JoinMatch(join).to_data(), options)
            .await?;
        match serde_json::from_value::<JoinAccepted>(reply) {
            Ok(accepted) => {
                debug!(team = ?accepted.player.team, director = ?accepted.director, "joined match");
                self.identity.team = Some(accepted.player.team);
                self.connection.set_team(self.identity.team);
            }
            Err(error) => warn!(%error, "unexpected join acknowledgement"),
        }
        Ok(())
    }

    /// Pulls the authoritative snapshot and overwrites local state with it.
    pub async fn reconcile(&mut self) -> Result<(), SessionError> {
        let snapshot = self
            .reconciler
            .request_full_state(&self.connection, &self.context.match_id)
            .await?;
        if self.reconciler.apply_snapshot(&mut self.engine, snapshot).is_ok() {
            self.publish_notifications();
        }
        Ok(())
    }

    pub async fn propose_sector(&mut self, polygon: Polygon) -> Result<Delivery, SessionError> {
        let events = self.engine.propose_sector(&self.identity.player_id, polygon)?;
        self.publish_notifications();
        self.emit_all(events).await
    }

    pub async fn confirm_sector(&mut self) -> Result<Delivery, SessionError> {
        let events = self.engine.confirm_sector(&self.identity.player_id)?;
        self.publish_notifications();
        self.emit_all(events).await
    }

    pub async fn propose_zone(&mut self, team: Team, polygon: Polygon) -> Result<Delivery, SessionError> {
        let events = self
            .engine
            .propose_zone(&self.identity.player_id, team, polygon)?;
        self.publish_notifications();
        self.emit_all(events).await
    }

    pub async fn confirm_zone(&mut self, team: Team) -> Result<Delivery, SessionError> {
        let events = self.engine.confirm_zone(&self.identity.player_id, team)?;
        self.publish_notifications();
        self.emit_all(events).await
    }

    pub async fn mark_ready(&mut self) -> Result<Delivery, SessionError> {
        let events = self.engine.mark_player_ready(&self.identity.player_id)?;
        self.publish_notifications();
        self.emit_all(events).await
    }

    pub async fn send_chat(&mut self, text: &str) -> Result<Delivery, SessionError> {
        let payload = json!({
            "matchId": self.context.match_id,
            "playerId": self.identity.player_id,
            "text": text,
            "timestamp": now_ms(),
        });
        self.send_relayed(events::CHAT_MESSAGE, payload, true).await
    }

    pub async fn send_report(&mut self, report: Value) -> Result<Delivery, SessionError> {
        let payload = json!({
            "matchId": self.context.match_id,
            "playerId": self.identity.player_id,
            "report": report,
            "timestamp": now_ms(),
        });
        self.send_relayed(events::REPORT, payload, true).await
    }

    /// Position updates are fire-and-forget and coalesce while offline. The
    /// latest position also rides along with the heartbeat.
    pub async fn report_position(&mut self, position: Point) -> Result<Delivery, SessionError> {
        self.connection.set_position(Some(position));
        let payload = json!({
            "matchId": self.context.match_id,
            "playerId": self.identity.player_id,
            "team": self.identity.team,
            "position": position,
            "timestamp": now_ms(),
        });
        self.send_relayed(events::POSITION_UPDATE, payload, false).await
    }

    async fn send_relayed(&mut self, event: &str, payload: Value, expect_ack: bool) -> Result<Delivery, SessionError> {
        let options = SendOptions {
            expect_ack,
            ..self.connection.default_send_options()
        };
        match self.connection.send(event, payload, options).await {
            Ok(_) => Ok(Delivery::Sent),
            Err(ConnectionError::Queued { class, .. }) => Ok(Delivery::Queued(class)),
            Err(error) => Err(error.into()),
        }
    }

    async fn emit_all(&mut self, events: Vec<MatchEvent>) -> Result<Delivery, SessionError> {
        let mut delivery = Delivery::Unchanged;
        for event in events {
            delivery = self.emit(event).await?;
        }
        Ok(delivery)
    }

    async fn emit(&mut self, event: MatchEvent) -> Result<Delivery, SessionError> {
        let name = event.name();
        let options = self.connection.default_send_options();
        match self.connection.send(name, event.to_data(), options).await {
            Ok(_) => Ok(Delivery::Sent),
            Err(ConnectionError::Queued { class, .. }) => {
                debug!(event = name, "intent queued until reconnect");
                Ok(Delivery::Queued(class))
            }
            Err(ConnectionError::Remote(remote)) if remote.kind.is_terminal() => {
                // The optimistic local change was refused; take the
                // authority's view instead.
                warn!(event = name, error = %remote, "authority rejected intent");
                self.resync().await;
                Err(ConnectionError::Remote(remote).into())
            }
            Err(error) => {
                // Timed out or out of retries: the authority may or may not
                // have applied the intent.
                warn!(event = name, %error, "intent outcome unknown");
                self.resync().await;
                Err(error.into())
            }
        }
    }

    /// Replaces optimistic local state with the authority's. On failure the
    /// next `reconnect` resynchronizes even if the link never dropped.
    async fn resync(&mut self) {
        if let Err(error) = self.reconcile().await {
            warn!(%error, "resynchronization failed");
            self.synced = false;
        }
    }

    /// Registers a handler for inbound `event` frames.
    pub fn on(&mut self, event: &str, handler: EventHandler) -> bool {
        let id = HandlerId::of(&handler);
        if !self.router.on(event, handler) {
            return false;
        }
        self.connection.register_event(event, id)
    }

    pub fn off(&mut self, event: &str) -> usize {
        let removed = self.router.off(event);
        for key in &removed {
            self.connection.unregister_event(key);
        }
        removed.len()
    }

    pub fn register_module(&mut self, name: &str, spec: ModuleSpec) -> bool {
        let Some(keys) = self.router.register_module(name, spec) else {
            return false;
        };
        for key in keys {
            self.connection.register_event(&key.event, key.handler);
        }
        true
    }

    pub fn unregister_module(&mut self, name: &str) -> bool {
        let Some(keys) = self.router.unregister_module(name) else {
            return false;
        };
        for key in &keys {
            self.connection.unregister_event(key);
        }
        true
    }

    pub fn subscribe(&mut self, observer: Arc<dyn MatchObserver>) -> bool {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, observer: &Arc<dyn MatchObserver>) -> bool {
        self.observers.unsubscribe(observer)
    }

    /// Applies one event from the reader task.
    pub fn process_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(WireFrame::Emit {
                event,
                event_id,
                data,
                ..
            }) => self.handle_broadcast(&event, event_id, &data),
            LinkEvent::Frame(WireFrame::Ack { ack_id, .. }) => {
                debug!(ack_id, "acknowledgement routed to the session");
            }
            LinkEvent::Disconnected { reason } => {
                if self.connection.is_connected() {
                    debug!(%reason, "ignoring disconnect notice from a replaced link");
                    return;
                }
                warn!(match_id = %self.context.match_id, %reason, "session offline");
                self.synced = false;
                self.router.set_connected(false);
                self.observers
                    .publish(&Notification::ConnectionStateChanged { connected: false });
            }
        }
    }

    fn handle_broadcast(&mut self, event: &str, event_id: Option<u64>, data: &Value) {
        if !self.router.accept(event_id) {
            return;
        }
        if events::CORE.contains(&event) {
            match MatchEvent::from_wire(event, data) {
                Ok(Some(update)) => self.apply_update(update),
                Ok(None) => {}
                Err(error) => warn!(event, %error, "malformed broadcast"),
            }
        }
        self.router.dispatch(event, data);
    }

    fn apply_update(&mut self, update: MatchEvent) {
        if let Some(timestamp) = update.timestamp() {
            if let Err(stale) = self.reconciler.admit(timestamp) {
                debug!(event = update.name(), %stale, "dropping stale update");
                return;
            }
        }
        self.engine.apply_remote(&update);
        self.publish_notifications();
    }

    fn publish_notifications(&mut self) {
        for notification in self.engine.take_notifications() {
            self.observers.publish(&notification);
        }
    }

    /// Processes every link event already waiting, without blocking.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.link_events.try_recv() {
            self.process_link_event(event);
            processed += 1;
        }
        processed
    }

    /// Processes link events until none arrives for `idle`.
    pub async fn process_until_idle(&mut self, idle: Duration) -> usize {
        let mut processed = 0;
        while let Ok(Some(event)) = tokio::time::timeout(idle, self.link_events.recv()).await {
            self.process_link_event(event);
            processed += 1;
        }
        processed
    }

    /// Serves link events until the reconnect budget runs out. Callers that
    /// need to stop earlier race this against their own shutdown signal.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        while let Some(event) = self.link_events.recv().await {
            let lost = matches!(event, LinkEvent::Disconnected { .. });
            self.process_link_event(event);
            if lost && !self.connection.is_connected() {
                self.recover().await?;
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.connection.shutdown();
        self.synced = false;
        self.router.set_connected(false);
        self.observers
            .publish(&Notification::ConnectionStateChanged { connected: false });
        info!(match_id = %self.context.match_id, "session closed");
    }
}
