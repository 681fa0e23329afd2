use super::*;
use crate::error::{MatchError, ValidationError};
use crate::geometry::{bounds_of, ensure_within, validate_polygon};
use crate::protocol::{ConfirmSector, ConfirmZone, ProposeSector, ProposeZone, ZonePayload};
use crate::types::{DeploymentZone, Polygon, Sector, ZoneStyle};

impl MatchPhaseEngine {
    /// Stores a provisional sector. A later proposal before confirmation
    /// replaces the earlier one.
    pub fn propose_sector(
        &mut self,
        actor: &str,
        polygon: Polygon,
    ) -> Result<Vec<MatchEvent>, MatchError> {
        self.check_sector_authority(actor)?;
        validate_polygon(&polygon)?;

        self.state.sector = Some(Sector {
            polygon: polygon.clone(),
            confirmed: false,
            proposed_by: Some(actor.to_string()),
        });
        self.notifications.push(Notification::SectorUpdated {
            polygon: Some(polygon.clone()),
            confirmed: false,
        });

        Ok(vec![MatchEvent::ProposeSector(ProposeSector {
            match_id: self.state.id.clone(),
            polygon,
        })])
    }

    /// Confirms the provisional sector and moves on to zone definition.
    /// Confirming an already confirmed sector is a no-op.
    pub fn confirm_sector(&mut self, actor: &str) -> Result<Vec<MatchEvent>, MatchError> {
        if self.state.is_sector_confirmed() {
            return Ok(Vec::new());
        }
        self.check_sector_authority(actor)?;
        let Some(sector) = self.state.sector.as_mut() else {
            return Err(ValidationError::NoSectorProposed.into());
        };

        sector.confirmed = true;
        let polygon = sector.polygon.clone();
        self.notifications.push(Notification::SectorUpdated {
            polygon: Some(polygon.clone()),
            confirmed: true,
        });
        self.set_sub_phase(SubPhase::ZoneDefinition);

        Ok(vec![MatchEvent::ConfirmSector(ConfirmSector {
            match_id: self.state.id.clone(),
            bounds: bounds_of(&polygon),
            polygon,
            cambiar_fase: true,
            timestamp: None,
        })])
    }

    pub fn propose_zone(
        &mut self,
        actor: &str,
        team: Team,
        polygon: Polygon,
    ) -> Result<Vec<MatchEvent>, MatchError> {
        self.check_zone_authority(actor)?;
        self.check_zone_order(team)?;
        if self.state.is_zone_confirmed(team) {
            return Err(ValidationError::ZoneAlreadyConfirmed(team).into());
        }
        validate_polygon(&polygon)?;
        if let Some(sector) = self.state.sector.as_ref() {
            ensure_within(&polygon, &sector.polygon, team)?;
        }

        let zone = DeploymentZone {
            team,
            polygon: polygon.clone(),
            confirmed: false,
            style: ZoneStyle::for_team(team),
            proposed_by: Some(actor.to_string()),
        };
        match self.state.zone_mut(team) {
            Some(existing) => *existing = zone,
            None => self.state.zones.push(zone),
        }
        self.notifications.push(Notification::ZoneUpdated {
            team,
            polygon: Some(polygon.clone()),
            confirmed: false,
        });

        Ok(vec![MatchEvent::ProposeZone(ProposeZone {
            match_id: self.state.id.clone(),
            team,
            polygon,
        })])
    }

    /// Finalizes a proposed zone. Confirming blue ends zone definition.
    pub fn confirm_zone(&mut self, actor: &str, team: Team) -> Result<Vec<MatchEvent>, MatchError> {
        if self.state.is_zone_confirmed(team) {
            return Ok(Vec::new());
        }
        self.check_zone_authority(actor)?;
        self.check_zone_order(team)?;
        let Some(zone) = self.state.zone_mut(team) else {
            return Err(ValidationError::NoZoneProposed(team).into());
        };

        zone.confirmed = true;
        let payload = ZonePayload::from_zone(zone);
        self.notifications.push(Notification::ZoneUpdated {
            team,
            polygon: Some(payload.polygon.clone()),
            confirmed: true,
        });
        if team == Team::Blue {
            self.set_sub_phase(SubPhase::Deployment);
        }

        Ok(vec![MatchEvent::ConfirmZone(ConfirmZone {
            match_id: self.state.id.clone(),
            zone: payload,
            timestamp: None,
        })])
    }

    fn check_zone_order(&self, team: Team) -> Result<(), ValidationError> {
        match team {
            Team::Red => Ok(()),
            Team::Blue if self.state.is_zone_confirmed(Team::Red) => Ok(()),
            Team::Blue => Err(ValidationError::ZoneOrdering),
            Team::None => Err(ValidationError::InvalidTeam),
        }
    }

    pub(super) fn apply_remote_sector(&mut self, confirm: &ConfirmSector) {
        if self.state.is_sector_confirmed() {
            return;
        }
        self.state.sector = Some(Sector {
            polygon: confirm.polygon.clone(),
            confirmed: confirm.cambiar_fase,
            proposed_by: self.state.director.clone(),
        });
        self.notifications.push(Notification::SectorUpdated {
            polygon: Some(confirm.polygon.clone()),
            confirmed: confirm.cambiar_fase,
        });
        if confirm.cambiar_fase && self.state.sub_phase == SubPhase::SectorDefinition {
            self.set_sub_phase(SubPhase::ZoneDefinition);
        }
    }

    pub(super) fn apply_remote_zone(&mut self, confirm: &ConfirmZone) {
        let team = confirm.zone.team;
        if !team.is_playing() || self.state.is_zone_confirmed(team) {
            return;
        }
        let zone = DeploymentZone {
            team,
            polygon: confirm.zone.polygon.clone(),
            confirmed: true,
            style: confirm.zone.style.clone(),
            proposed_by: self.state.director.clone(),
        };
        match self.state.zone_mut(team) {
            Some(existing) => *existing = zone,
            None => self.state.zones.push(zone),
        }
        self.notifications.push(Notification::ZoneUpdated {
            team,
            polygon: Some(confirm.zone.polygon.clone()),
            confirmed: true,
        });
        if team == Team::Blue && self.state.sub_phase == SubPhase::ZoneDefinition {
            self.set_sub_phase(SubPhase::Deployment);
        }
    }
}
