use super::*;
use crate::error::{MatchError, ValidationError};
use crate::utils::now_ms;

impl MatchPhaseEngine {
    /// Marks `player_id` ready for the current stage and, once every team
    /// member is ready, hands over to the next stage.
    pub fn mark_player_ready(&mut self, player_id: &str) -> Result<Vec<MatchEvent>, MatchError> {
        let Some(player) = self.state.player(player_id) else {
            return Err(PermissionDenied::UnknownPlayer(player_id.to_string()).into());
        };
        if !self.readiness_open() {
            return Err(PermissionDenied::WrongPhase {
                action: "readiness",
                phase: self.state.phase,
                sub_phase: self.state.sub_phase,
            }
            .into());
        }
        if player.ready {
            return Ok(Vec::new());
        }

        let event = self.ready_event(player_id, true);
        self.set_ready(player_id, true);
        self.advance_if_all_ready();
        Ok(vec![event])
    }

    /// Authority-side variant that also rejects readiness declared for a
    /// stage that has already passed.
    pub fn accept_ready(&mut self, actor: &str, ready: &ReadyState) -> Result<Vec<MatchEvent>, MatchError> {
        if ready.player_id != actor {
            return Err(PermissionDenied::ActingForOther {
                actor: actor.to_string(),
                target: ready.player_id.clone(),
            }
            .into());
        }
        if !self.is_current_stage(ready) {
            return Err(ValidationError::StaleStage.into());
        }
        self.mark_player_ready(actor)
    }

    /// True when at least one player is on a team and every team member is
    /// ready. Unassigned players do not block the hand-off.
    pub fn all_players_ready(&self) -> bool {
        let mut members = self
            .state
            .players
            .iter()
            .filter(|player| player.team.is_playing())
            .peekable();
        members.peek().is_some() && members.all(|player| player.ready)
    }

    pub(super) fn apply_remote_ready(&mut self, ready: &ReadyState) {
        if !self.is_current_stage(ready) {
            debug!(player = %ready.player_id, "ignoring readiness for a past stage");
            return;
        }
        let known = self.state.player(&ready.player_id).map(|player| player.ready);
        if known.is_none() || known == Some(ready.ready) {
            return;
        }
        self.set_ready(&ready.player_id, ready.ready);
        if ready.ready {
            self.advance_if_all_ready();
        }
    }

    fn is_current_stage(&self, ready: &ReadyState) -> bool {
        ready.phase == self.state.phase
            && ready.sub_phase == self.state.sub_phase
            && ready.turn == self.state.turn.turn
    }

    fn readiness_open(&self) -> bool {
        matches!(
            self.state.sub_phase,
            SubPhase::Deployment | SubPhase::Movement | SubPhase::Engagement
        )
    }

    fn set_ready(&mut self, player_id: &str, ready: bool) {
        if let Some(player) = self.state.player_mut(player_id) {
            player.ready = ready;
            self.notifications.push(Notification::PlayerReadyChanged {
                player_id: player_id.to_string(),
                ready,
            });
        }
    }

    /// The only bridge into the turn clock: deployment hands over to combat
    /// and, inside combat, movement and engagement alternate per turn.
    fn advance_if_all_ready(&mut self) {
        if !self.all_players_ready() {
            return;
        }
        let now = now_ms();
        match self.state.sub_phase {
            SubPhase::Deployment => {
                self.state.turn.start(now);
                self.set_sub_phase(SubPhase::Movement);
            }
            SubPhase::Movement => self.set_sub_phase(SubPhase::Engagement),
            SubPhase::Engagement => {
                self.state.turn.advance(now);
                self.set_sub_phase(SubPhase::Movement);
            }
            SubPhase::SectorDefinition | SubPhase::ZoneDefinition => return,
        }

        let ready_ids: Vec<PlayerId> = self
            .state
            .players
            .iter()
            .filter(|player| player.ready)
            .map(|player| player.id.clone())
            .collect();
        for player_id in ready_ids {
            self.set_ready(&player_id, false);
        }
    }
}
