use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::events;

/// Outbound queue an event waits in while the transport is down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Message,
    Report,
    Position,
    Generic,
}

impl EventClass {
    /// Order in which queues are drained after reconnecting. State changes go
    /// first so that chat and reports land on an up-to-date match.
    pub const FLUSH_ORDER: [EventClass; 4] = [
        EventClass::Generic,
        EventClass::Message,
        EventClass::Report,
        EventClass::Position,
    ];
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    pub event_name: String,
    pub payload: Value,
    pub enqueued_at_ms: u64,
    pub expect_ack: bool,
}

/// Explicit event name to queue mapping. Unknown names are generic.
#[derive(Clone, Debug)]
pub struct EventClassTable {
    classes: HashMap<String, EventClass>,
}

impl Default for EventClassTable {
    fn default() -> Self {
        let mut table = Self {
            classes: HashMap::new(),
        };
        table.assign(events::CHAT_MESSAGE, EventClass::Message);
        table.assign(events::REPORT, EventClass::Report);
        table.assign(events::POSITION_UPDATE, EventClass::Position);
        table
    }
}

impl EventClassTable {
    pub fn assign(&mut self, event: impl Into<String>, class: EventClass) {
        self.classes.insert(event.into(), class);
    }

    pub fn classify(&self, event: &str) -> EventClass {
        self.classes
            .get(event)
            .copied()
            .unwrap_or(EventClass::Generic)
    }
}

/// The four offline queues. Message, report and generic queues are FIFO and
/// lossless; the position queue only ever holds the latest position.
#[derive(Debug, Default)]
pub struct PendingQueues {
    message: VecDeque<PendingEvent>,
    report: VecDeque<PendingEvent>,
    position: VecDeque<PendingEvent>,
    generic: VecDeque<PendingEvent>,
}

impl PendingQueues {
    pub fn enqueue(&mut self, class: EventClass, event: PendingEvent) {
        let queue = self.queue_mut(class);
        if class == EventClass::Position {
            queue.clear();
        }
        queue.push_back(event);
    }

    /// Takes every queue at once, in flush order. Empty queues are skipped.
    pub fn drain_all(&mut self) -> Vec<(EventClass, Vec<PendingEvent>)> {
        EventClass::FLUSH_ORDER
            .into_iter()
            .filter_map(|class| {
                let drained: Vec<PendingEvent> = self.queue_mut(class).drain(..).collect();
                (!drained.is_empty()).then_some((class, drained))
            })
            .collect()
    }

    /// Puts unsent entries back ahead of anything queued since the drain. A
    /// position enqueued in the meantime supersedes the returned one.
    pub fn requeue_front(&mut self, class: EventClass, entries: Vec<PendingEvent>) {
        let queue = self.queue_mut(class);
        if class == EventClass::Position {
            if queue.is_empty() {
                if let Some(latest) = entries.into_iter().last() {
                    queue.push_back(latest);
                }
            }
            return;
        }
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    pub fn len(&self, class: EventClass) -> usize {
        match class {
            EventClass::Message => self.message.len(),
            EventClass::Report => self.report.len(),
            EventClass::Position => self.position.len(),
            EventClass::Generic => self.generic.len(),
        }
    }

    pub fn total(&self) -> usize {
        EventClass::FLUSH_ORDER
            .into_iter()
            .map(|class| self.len(class))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn queue_mut(&mut self, class: EventClass) -> &mut VecDeque<PendingEvent> {
        match class {
            EventClass::Message => &mut self.message,
            EventClass::Report => &mut self.report,
            EventClass::Position => &mut self.position,
            EventClass::Generic => &mut self.generic,
        }
    }
}
