use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::connection::transport::Connector;
use crate::connection::{ConnectionManager, SendOptions};
use crate::engine::MatchPhaseEngine;
use crate::error::{ConnectionError, StaleState};
use crate::protocol::{events, RequestSnapshot};
use crate::types::MatchSnapshot;

/// Brings a client back in line with the authority after (re)connecting and
/// guards against replayed or reordered phase updates.
#[derive(Clone, Debug)]
pub struct ReconciliationService {
    last_applied: u64,
    snapshot_timeout: Duration,
}

impl ReconciliationService {
    pub fn new(snapshot_timeout: Duration) -> Self {
        Self {
            last_applied: 0,
            snapshot_timeout,
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Accepts an authority timestamp only if it is newer than everything
    /// applied so far.
    pub fn admit(&mut self, timestamp: u64) -> Result<(), StaleState> {
        if timestamp <= self.last_applied {
            return Err(StaleState {
                timestamp,
                last_applied: self.last_applied,
            });
        }
        self.last_applied = timestamp;
        Ok(())
    }

    /// Asks the authority for the full match state. The acknowledgement
    /// carries the snapshot.
    pub async fn request_full_state<C: Connector>(
        &self,
        connection: &ConnectionManager<C>,
        match_id: &str,
    ) -> Result<MatchSnapshot, ConnectionError> {
        let request = RequestSnapshot {
            match_id: match_id.to_string(),
        };
        let payload = serde_json::to_value(request).map_err(|error| ConnectionError::Protocol(error.to_string()))?;
        let options = SendOptions {
            timeout: self.snapshot_timeout,
            queue_if_offline: false,
            expect_ack: true,
            ..connection.default_send_options()
        };
        let reply: Value = connection.send(events::REQUEST_SNAPSHOT, payload, options).await?;
        serde_json::from_value(reply).map_err(|error| ConnectionError::Protocol(error.to_string()))
    }

    /// Overwrites local state with `snapshot`. Unconfirmed local geometry the
    /// authority does not know about is discarded.
    pub fn apply_snapshot(&mut self, engine: &mut MatchPhaseEngine, snapshot: MatchSnapshot) -> Result<(), StaleState> {
        if let Err(stale) = self.admit(snapshot.timestamp) {
            debug!(%stale, "ignoring stale snapshot");
            return Err(stale);
        }
        info!(
            match_id = %snapshot.match_id,
            phase = ?snapshot.phase,
            sub_phase = ?snapshot.sub_phase,
            "applying authoritative snapshot"
        );
        engine.restore(snapshot);
        Ok(())
    }
}
