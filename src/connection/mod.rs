//! Client side of the transport: one session per match membership, acked
//! sends with bounded retries, offline queues, heartbeat and reconnection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{ConnectionError, RemoteError, RemoteErrorKind};
use crate::protocol::{events, parse_frame, Heartbeat, WireFrame};
use crate::router::{EventKey, HandlerId};
use crate::types::{Identity, MatchContext, Point, Team};
use crate::utils::now_ms;

pub mod loopback;
pub mod queue;
pub mod transport;

use self::queue::{EventClass, EventClassTable, PendingEvent, PendingQueues};
use self::transport::{Connector, Link};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SendOptions {
    pub retries: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
    pub queue_if_offline: bool,
    pub expect_ack: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        let config = CoordinatorConfig::default();
        Self {
            retries: config.send_retries,
            timeout: config.send_timeout,
            retry_delay: config.retry_delay,
            queue_if_offline: true,
            expect_ack: true,
        }
    }
}

impl SendOptions {
    /// Single unacknowledged attempt, never queued.
    pub fn heartbeat(interval: Duration) -> Self {
        Self {
            retries: 1,
            timeout: interval,
            queue_if_offline: false,
            expect_ack: false,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub send: SendOptions,
    pub reconnect_min_interval: Duration,
    pub reconnect_timeout: Duration,
    pub class_table: EventClassTable,
}

impl From<&CoordinatorConfig> for ConnectionOptions {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            send: SendOptions {
                retries: config.send_retries,
                timeout: config.send_timeout,
                retry_delay: config.retry_delay,
                ..SendOptions::default()
            },
            reconnect_min_interval: config.reconnect_min_interval,
            reconnect_timeout: config.reconnect_timeout,
            class_table: EventClassTable::default(),
        }
    }
}

/// What the reader task hands to the session.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    Frame(WireFrame),
    Disconnected { reason: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    pub requeued: usize,
}

type AckReply = Result<Value, RemoteError>;

struct Session {
    identity: Identity,
    context: MatchContext,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    session: Option<Session>,
    generation: u64,
    last_retry_at: Option<Instant>,
    queues: PendingQueues,
    class_table: EventClassTable,
    registered: HashSet<EventKey>,
    buffered: Vec<EventKey>,
    pending_acks: HashMap<u64, oneshot::Sender<AckReply>>,
    heartbeat: Option<JoinHandle<()>>,
    position: Option<Point>,
}

struct Shared<C> {
    connector: C,
    options: ConnectionOptions,
    inner: Mutex<Inner>,
    connected: watch::Sender<bool>,
    next_ack_id: AtomicU64,
    link_events: mpsc::UnboundedSender<LinkEvent>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending-ack entry when the waiting attempt finishes or is
/// dropped by the surrounding timeout.
struct AckSlot<'a> {
    inner: &'a Mutex<Inner>,
    ack_id: u64,
}

impl Drop for AckSlot<'_> {
    fn drop(&mut self) {
        lock(self.inner).pending_acks.remove(&self.ack_id);
    }
}

pub struct ConnectionManager<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, options: ConnectionOptions) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (link_events, link_events_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let inner = Inner {
            session: None,
            generation: 0,
            last_retry_at: None,
            queues: PendingQueues::default(),
            class_table: options.class_table.clone(),
            registered: HashSet::new(),
            buffered: Vec::new(),
            pending_acks: HashMap::new(),
            heartbeat: None,
            position: None,
        };
        let shared = Shared {
            connector,
            options,
            inner: Mutex::new(inner),
            connected,
            next_ack_id: AtomicU64::new(1),
            link_events,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            link_events_rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.shared.inner)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn has_session(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn default_send_options(&self) -> SendOptions {
        self.shared.options.send
    }

    /// Creates the session for this match membership and opens the link.
    /// Returns false if a session already exists or the connect failed; in
    /// the latter case the session is kept so `reconnect` can retry.
    pub async fn initialize(&self, identity: Identity, context: MatchContext) -> bool {
        {
            let mut inner = self.lock();
            if inner.session.is_some() {
                warn!(match_id = %context.match_id, "connection session already exists");
                return false;
            }
            info!(
                match_id = %context.match_id,
                player_id = %identity.player_id,
                "creating connection session"
            );
            inner.session = Some(Session {
                identity,
                context,
                outbound: None,
                reader: None,
            });
            let buffered = std::mem::take(&mut inner.buffered);
            inner.registered.extend(buffered);
        }

        match self.open_link().await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "initial connect failed");
                false
            }
        }
    }

    /// Re-establishes the link. Returns true at once while connected and
    /// false when called again before `reconnect_min_interval` elapsed.
    pub async fn reconnect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        {
            let mut inner = self.lock();
            let now = Instant::now();
            if let Some(last) = inner.last_retry_at {
                if now.duration_since(last) < self.shared.options.reconnect_min_interval {
                    debug!("reconnect attempted too soon");
                    return false;
                }
            }
            inner.last_retry_at = Some(now);
            let Some(session) = inner.session.as_mut() else {
                warn!("reconnect without a session");
                return false;
            };
            if let Some(reader) = session.reader.take() {
                reader.abort();
            }
            session.outbound = None;
        }

        match self.open_link().await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "reconnect failed");
                false
            }
        }
    }

    async fn open_link(&self) -> Result<(), ConnectionError> {
        let (identity, context) = {
            let inner = self.lock();
            let session = inner.session.as_ref().ok_or(ConnectionError::NotConnected)?;
            (session.identity.clone(), session.context.clone())
        };

        let timeout = self.shared.options.reconnect_timeout;
        let link = tokio::time::timeout(
            timeout,
            self.shared.connector.connect(&identity, &context),
        )
        .await
        .map_err(|_| ConnectionError::Timeout {
            event: "connect".to_string(),
            after_ms: timeout.as_millis() as u64,
        })??;
        self.attach(link);
        info!(match_id = %context.match_id, player_id = %identity.player_id, "connected");
        Ok(())
    }

    fn attach(&self, link: Link) {
        let Link { outbound, inbound } = link;
        let mut inner = self.lock();
        inner.generation += 1;
        let generation = inner.generation;
        let reader = self.spawn_reader(inbound, generation);
        if let Some(session) = inner.session.as_mut() {
            if let Some(previous) = session.reader.replace(reader) {
                previous.abort();
            }
            session.outbound = Some(outbound);
        }
        self.shared.connected.send_replace(true);
    }

    fn spawn_reader(&self, mut inbound: mpsc::UnboundedReceiver<String>, generation: u64) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                manager.handle_inbound(&raw);
            }
            manager.mark_disconnected(generation, "link closed");
        })
    }

    fn handle_inbound(&self, raw: &str) {
        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                return;
            }
        };
        match frame {
            WireFrame::Ack {
                ack_id,
                ok,
                data,
                error,
            } => {
                let Some(waiting) = self.lock().pending_acks.remove(&ack_id) else {
                    debug!(ack_id, "acknowledgement without a waiting send");
                    return;
                };
                let reply = if ok {
                    Ok(data)
                } else {
                    Err(error.unwrap_or_else(|| {
                        RemoteError::new(RemoteErrorKind::Internal, "rejected without reason")
                    }))
                };
                let _ = waiting.send(reply);
            }
            WireFrame::Emit { ref event, .. } => {
                if !self.is_registered(event) {
                    debug!(event = %event, "dropping unregistered event");
                    return;
                }
                let _ = self.shared.link_events.send(LinkEvent::Frame(frame));
            }
        }
    }

    fn mark_disconnected(&self, generation: u64, reason: &str) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            if let Some(session) = inner.session.as_mut() {
                session.outbound = None;
                session.reader = None;
            }
            inner.pending_acks.clear();
        }
        if self.shared.connected.send_replace(false) {
            warn!(reason, "connection lost");
            let _ = self.shared.link_events.send(LinkEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Tears down the session and heartbeat. Queued events and registrations
    /// are kept.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(heartbeat) = inner.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(session) = inner.session.take() {
            if let Some(reader) = session.reader {
                reader.abort();
            }
        }
        inner.pending_acks.clear();
        self.shared.connected.send_replace(false);
    }

    /// Sends one event. Offline sends are queued when allowed and reported
    /// as `Queued`; online sends retry retryable failures with a fixed delay,
    /// all bounded by a single timeout.
    pub async fn send(&self, event: &str, payload: Value, options: SendOptions) -> Result<Value, ConnectionError> {
        if !self.is_connected() {
            if options.queue_if_offline {
                let class = self.enqueue(event, payload, options.expect_ack);
                debug!(event, ?class, "queued while offline");
                return Err(ConnectionError::Queued {
                    event: event.to_string(),
                    class,
                });
            }
            return Err(ConnectionError::NotConnected);
        }

        let ack_id = options
            .expect_ack
            .then(|| self.shared.next_ack_id.fetch_add(1, Ordering::Relaxed));
        let attempts = self.deliver(event, &payload, ack_id, &options);
        match tokio::time::timeout(options.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(event, "send timed out");
                Err(ConnectionError::Timeout {
                    event: event.to_string(),
                    after_ms: options.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn deliver(
        &self,
        event: &str,
        payload: &Value,
        ack_id: Option<u64>,
        options: &SendOptions,
    ) -> Result<Value, ConnectionError> {
        let attempts = options.retries.max(1);
        for attempt in 1..=attempts {
            match self.attempt(event, payload, ack_id).await {
                Ok(reply) => return Ok(reply),
                Err(error) if error.is_terminal() => return Err(error),
                Err(error) => warn!(event, attempt, %error, "send attempt failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(options.retry_delay).await;
            }
        }
        Err(ConnectionError::RetriesExhausted {
            event: event.to_string(),
            attempts,
        })
    }

    async fn attempt(&self, event: &str, payload: &Value, ack_id: Option<u64>) -> Result<Value, ConnectionError> {
        let frame = WireFrame::Emit {
            event: event.to_string(),
            ack_id,
            event_id: None,
            data: payload.clone(),
        };
        let text = serde_json::to_string(&frame).map_err(|error| ConnectionError::Protocol(error.to_string()))?;

        let Some(ack_id) = ack_id else {
            self.write(text)?;
            return Ok(Value::Null);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.lock().pending_acks.insert(ack_id, reply_tx);
        let _slot = AckSlot {
            inner: &self.shared.inner,
            ack_id,
        };
        self.write(text)?;
        match reply_rx.await {
            Ok(reply) => reply.map_err(ConnectionError::Remote),
            Err(_) => Err(ConnectionError::Transport(
                "link closed before acknowledgement".to_string(),
            )),
        }
    }

    fn write(&self, text: String) -> Result<(), ConnectionError> {
        let inner = self.lock();
        let outbound = inner
            .session
            .as_ref()
            .and_then(|session| session.outbound.as_ref())
            .ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(text)
            .map_err(|_| ConnectionError::Transport("link closed".to_string()))
    }

    fn enqueue(&self, event: &str, payload: Value, expect_ack: bool) -> EventClass {
        let mut inner = self.lock();
        let class = inner.class_table.classify(event);
        inner.queues.enqueue(
            class,
            PendingEvent {
                event_name: event.to_string(),
                payload,
                enqueued_at_ms: now_ms(),
                expect_ack,
            },
        );
        class
    }

    pub fn assign_class(&self, event: &str, class: EventClass) {
        self.lock().class_table.assign(event, class);
    }

    pub fn pending_len(&self, class: EventClass) -> usize {
        self.lock().queues.len(class)
    }

    /// Sends everything queued while offline. Each queue is taken atomically
    /// and sent in order; entries that fail for any retryable reason go back
    /// to the front of their queue, terminal rejections are dropped.
    pub async fn flush_pending(&self) -> FlushReport {
        let mut drained = self.lock().queues.drain_all().into_iter();
        let mut report = FlushReport::default();
        let base = SendOptions {
            queue_if_offline: false,
            ..self.shared.options.send
        };

        while let Some((class, entries)) = drained.next() {
            let mut entries = entries.into_iter();
            while let Some(entry) = entries.next() {
                let options = SendOptions {
                    expect_ack: entry.expect_ack,
                    ..base
                };
                match self.send(&entry.event_name, entry.payload.clone(), options).await {
                    Ok(_) => report.sent += 1,
                    Err(error) if !error.is_terminal() => {
                        warn!(event = %entry.event_name, %error, "flush interrupted, requeueing");
                        self.requeue(class, std::iter::once(entry).chain(entries).collect(), &mut report);
                        for (class, entries) in drained {
                            self.requeue(class, entries, &mut report);
                        }
                        return report;
                    }
                    Err(error) => {
                        warn!(event = %entry.event_name, %error, "dropping queued event");
                        report.dropped += 1;
                    }
                }
            }
        }
        if report.sent > 0 || report.dropped > 0 {
            info!(sent = report.sent, dropped = report.dropped, "flushed pending events");
        }
        report
    }

    fn requeue(&self, class: EventClass, entries: Vec<PendingEvent>, report: &mut FlushReport) {
        report.requeued += entries.len();
        self.lock().queues.requeue_front(class, entries);
    }

    /// Records that `handler` listens to `event`. Registrations made before a
    /// session exists are buffered and replayed by `initialize`.
    pub fn register_event(&self, event: &str, handler: HandlerId) -> bool {
        let key = EventKey::new(event, handler);
        let mut inner = self.lock();
        if inner.registered.contains(&key) || inner.buffered.contains(&key) {
            debug!(event, "event already registered");
            return false;
        }
        if inner.session.is_some() {
            inner.registered.insert(key);
        } else {
            inner.buffered.push(key);
        }
        true
    }

    pub fn unregister_event(&self, key: &EventKey) -> bool {
        let mut inner = self.lock();
        let before = inner.buffered.len();
        inner.buffered.retain(|buffered| buffered != key);
        inner.registered.remove(key) || inner.buffered.len() != before
    }

    pub fn is_registered(&self, event: &str) -> bool {
        let inner = self.lock();
        inner.registered.iter().any(|key| key.event == event)
    }

    pub fn set_position(&self, position: Option<Point>) {
        self.lock().position = position;
    }

    /// Records the team the authority assigned, carried by later heartbeats.
    pub fn set_team(&self, team: Option<Team>) {
        if let Some(session) = self.lock().session.as_mut() {
            session.identity.team = team;
        }
    }

    /// Starts the liveness heartbeat, replacing any running one.
    pub fn start_heartbeat(&self, interval: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !manager.is_connected() {
                    continue;
                }
                let Some(payload) = manager.heartbeat_payload() else {
                    continue;
                };
                if let Err(error) = manager
                    .send(events::HEARTBEAT, payload, SendOptions::heartbeat(interval))
                    .await
                {
                    debug!(%error, "heartbeat not delivered");
                }
            }
        });
        if let Some(previous) = self.lock().heartbeat.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.lock().heartbeat.take() {
            heartbeat.abort();
        }
    }

    fn heartbeat_payload(&self) -> Option<Value> {
        let inner = self.lock();
        let identity = &inner.session.as_ref()?.identity;
        let heartbeat = Heartbeat {
            player_id: identity.player_id.clone(),
            team: identity.team.filter(|team| *team != Team::None),
            position: inner.position,
            timestamp: now_ms(),
        };
        serde_json::to_value(heartbeat).ok()
    }
}
