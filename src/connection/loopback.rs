//! In-process transport bound to a `MatchAuthority`, with fault injection.
//! Used by the simulator and the integration tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::authority::{MatchAuthority, Outbound};
use crate::error::{ConnectionError, RemoteError, RemoteErrorKind};
use crate::protocol::{parse_frame, WireFrame};
use crate::types::{Identity, Match, MatchContext, PlayerId};

use super::transport::{Connector, Link};

struct Member {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct HubState {
    authority: MatchAuthority,
    members: HashMap<PlayerId, Member>,
    next_generation: u64,
    offline: HashSet<PlayerId>,
    failures: HashMap<String, u32>,
    stall_acks: bool,
    log: Vec<(PlayerId, WireFrame)>,
}

impl HubState {
    fn send_to(&self, player_id: &str, frame: &WireFrame) {
        let Some(member) = self.members.get(player_id) else {
            return;
        };
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = member.tx.send(text);
            }
            Err(error) => warn!(%error, "failed to encode frame"),
        }
    }

    fn route(&self, outbound: Vec<Outbound>) {
        for Outbound { audience, frame } in outbound {
            let Ok(text) = serde_json::to_string(&frame) else {
                warn!("failed to encode broadcast");
                continue;
            };
            for (player_id, member) in &self.members {
                if audience.includes(player_id) {
                    let _ = member.tx.send(text.clone());
                }
            }
        }
    }

    fn disconnect(&mut self, player_id: &str) {
        let outbound = self.authority.player_disconnected(player_id);
        self.route(outbound);
    }
}

/// Shared handle to one in-process match authority.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new(match_id: impl Into<String>) -> Self {
        let state = HubState {
            authority: MatchAuthority::new(match_id),
            members: HashMap::new(),
            next_generation: 0,
            offline: HashSet::new(),
            failures: HashMap::new(),
            stall_acks: false,
            log: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector { hub: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the player's current link from the authority side.
    pub fn drop_link(&self, player_id: &str) {
        let mut state = self.lock();
        if state.members.remove(player_id).is_some() {
            debug!(player_id, "dropping loopback link");
            state.disconnect(player_id);
        }
    }

    /// While offline the player's link is dropped and connects are refused.
    pub fn set_offline(&self, player_id: &str, offline: bool) {
        if offline {
            self.lock().offline.insert(player_id.to_string());
            self.drop_link(player_id);
        } else {
            self.lock().offline.remove(player_id);
        }
    }

    /// The next `times` requests for `event` are rejected with a retryable
    /// internal error before reaching the authority.
    pub fn fail_next(&self, event: &str, times: u32) {
        self.lock().failures.insert(event.to_string(), times);
    }

    /// Requests still reach the authority but their acknowledgements vanish.
    pub fn stall_acks(&self, stall: bool) {
        self.lock().stall_acks = stall;
    }

    pub fn authority_state(&self) -> Match {
        self.lock().authority.engine().state().clone()
    }

    pub fn is_attached(&self, player_id: &str) -> bool {
        self.lock().members.contains_key(player_id)
    }

    /// Every frame the player sent, in arrival order.
    pub fn frames_from(&self, player_id: &str) -> Vec<WireFrame> {
        self.lock()
            .log
            .iter()
            .filter(|(sender, _)| sender == player_id)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn sent_count(&self, player_id: &str, event: &str) -> usize {
        self.frames_from(player_id)
            .iter()
            .filter(|frame| frame.event_name() == Some(event))
            .count()
    }

    fn attach(&self, identity: &Identity, context: &MatchContext) -> Result<Link, ConnectionError> {
        let player_id = identity.player_id.clone();
        let (client, authority_side) = Link::pair();
        let generation = {
            let mut state = self.lock();
            if state.authority.match_id() != context.match_id {
                return Err(ConnectionError::Transport(format!(
                    "unknown match {}",
                    context.match_id
                )));
            }
            if state.offline.contains(&player_id) {
                return Err(ConnectionError::Transport("authority unreachable".to_string()));
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.members.insert(
                player_id.clone(),
                Member {
                    generation,
                    tx: authority_side.outbound,
                },
            );
            generation
        };

        let hub = self.clone();
        let mut inbound = authority_side.inbound;
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                hub.deliver(&player_id, generation, &raw);
            }
            hub.detach(&player_id, generation);
        });
        Ok(client)
    }

    fn deliver(&self, player_id: &str, generation: u64, raw: &str) {
        let mut state = self.lock();
        let current = state
            .members
            .get(player_id)
            .map(|member| member.generation == generation)
            .unwrap_or(false);
        if !current {
            debug!(player_id, "ignoring frame from a replaced link");
            return;
        }
        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(player_id, %error, "authority received a malformed frame");
                return;
            }
        };
        state.log.push((player_id.to_string(), frame.clone()));

        if let WireFrame::Emit { event, ack_id, .. } = &frame {
            if let Some(remaining) = state.failures.get_mut(event).filter(|left| **left > 0) {
                *remaining -= 1;
                if let Some(ack_id) = *ack_id {
                    let error = RemoteError::new(RemoteErrorKind::Internal, "injected failure");
                    state.send_to(player_id, &WireFrame::ack_err(ack_id, error));
                }
                return;
            }
        }

        let outcome = state.authority.handle(player_id, frame);
        if let Some(reply) = outcome.reply.filter(|_| !state.stall_acks) {
            state.send_to(player_id, &reply);
        }
        state.route(outcome.broadcasts);
    }

    fn detach(&self, player_id: &str, generation: u64) {
        let mut state = self.lock();
        let current = state
            .members
            .get(player_id)
            .map(|member| member.generation == generation)
            .unwrap_or(false);
        if current {
            state.members.remove(player_id);
            state.disconnect(player_id);
        }
    }
}

#[derive(Clone)]
pub struct LoopbackConnector {
    hub: LoopbackHub,
}

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        identity: &Identity,
        context: &MatchContext,
    ) -> impl Future<Output = Result<Link, ConnectionError>> + Send {
        let result = self.hub.attach(identity, context);
        async move { result }
    }
}
