use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::error::HandlerError;
use crate::types::{Notification, Phase, Polygon, SubPhase, Team};

/// Collaborator callbacks for match changes. Every method defaults to a
/// no-op so observers only implement what they render.
pub trait MatchObserver: Send + Sync {
    fn on_phase_changed(&self, _phase: Phase, _sub_phase: SubPhase) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_sector_updated(&self, _polygon: Option<&Polygon>, _confirmed: bool) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_zone_updated(
        &self,
        _team: Team,
        _polygon: Option<&Polygon>,
        _confirmed: bool,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_connection_state_changed(&self, _connected: bool) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_player_ready_changed(&self, _player_id: &str, _ready: bool) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_director_changed(&self, _director: Option<&str>, _temporary: bool) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ObserverHub {
    observers: Vec<Arc<dyn MatchObserver>>,
}

impl ObserverHub {
    pub fn subscribe(&mut self, observer: Arc<dyn MatchObserver>) -> bool {
        if self
            .observers
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &observer))
        {
            return false;
        }
        self.observers.push(observer);
        true
    }

    pub fn unsubscribe(&mut self, observer: &Arc<dyn MatchObserver>) -> bool {
        let before = self.observers.len();
        self.observers
            .retain(|existing| !Arc::ptr_eq(existing, observer));
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers `notification` to every observer. Failures and panics are
    /// logged per observer; returns how many observers failed.
    pub fn publish(&self, notification: &Notification) -> usize {
        let mut failures = 0;
        for observer in &self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| deliver(observer.as_ref(), notification)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    failures += 1;
                    warn!(?notification, %error, "observer failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(?notification, "observer panicked");
                }
            }
        }
        failures
    }
}

fn deliver(observer: &dyn MatchObserver, notification: &Notification) -> Result<(), HandlerError> {
    match notification {
        Notification::PhaseChanged { phase, sub_phase } => observer.on_phase_changed(*phase, *sub_phase),
        Notification::SectorUpdated { polygon, confirmed } => {
            observer.on_sector_updated(polygon.as_ref(), *confirmed)
        }
        Notification::ZoneUpdated {
            team,
            polygon,
            confirmed,
        } => observer.on_zone_updated(*team, polygon.as_ref(), *confirmed),
        Notification::ConnectionStateChanged { connected } => {
            observer.on_connection_state_changed(*connected)
        }
        Notification::PlayerReadyChanged { player_id, ready } => {
            observer.on_player_ready_changed(player_id, *ready)
        }
        Notification::DirectorChanged {
            director,
            temporary,
        } => observer.on_director_changed(director.as_deref(), *temporary),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<SubPhase>>,
    }

    impl MatchObserver for Recorder {
        fn on_phase_changed(&self, _phase: Phase, sub_phase: SubPhase) -> Result<(), HandlerError> {
            if let Ok(mut phases) = self.phases.lock() {
                phases.push(sub_phase);
            }
            Ok(())
        }
    }

    struct Broken;

    impl MatchObserver for Broken {
        fn on_phase_changed(&self, _phase: Phase, _sub_phase: SubPhase) -> Result<(), HandlerError> {
            panic!("renderer crashed")
        }

        fn on_connection_state_changed(&self, _connected: bool) -> Result<(), HandlerError> {
            Err(HandlerError::new("status bar missing"))
        }
    }

    #[test]
    fn failing_observer_does_not_block_the_others() {
        let recorder = Arc::new(Recorder::default());
        let mut hub = ObserverHub::default();
        assert!(hub.subscribe(Arc::new(Broken)));
        assert!(hub.subscribe(recorder.clone()));

        let failures = hub.publish(&Notification::PhaseChanged {
            phase: Phase::Preparation,
            sub_phase: SubPhase::ZoneDefinition,
        });
        assert_eq!(failures, 1);
        assert_eq!(
            hub.publish(&Notification::ConnectionStateChanged { connected: false }),
            1
        );
        assert_eq!(
            *recorder.phases.lock().expect("recorder lock"),
            vec![SubPhase::ZoneDefinition]
        );
    }

    #[test]
    fn the_same_observer_subscribes_once() {
        let recorder: Arc<dyn MatchObserver> = Arc::new(Recorder::default());
        let mut hub = ObserverHub::default();
        assert!(hub.subscribe(recorder.clone()));
        assert!(!hub.subscribe(recorder.clone()));
        assert!(hub.unsubscribe(&recorder));
        assert!(hub.is_empty());
    }
}
