use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::HandlerError;

pub type EventHandler = Arc<dyn Fn(&Value) -> Result<(), HandlerError> + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Identity of a registered handler, taken from the address of its shared
/// allocation. Registering the same `Arc` twice yields the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

impl HandlerId {
    /// Reserved for the session's own phase-engine subscriptions.
    pub const CORE: HandlerId = HandlerId(0);

    pub fn of(handler: &EventHandler) -> Self {
        Self(Arc::as_ptr(handler) as *const () as usize)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub event: String,
    pub handler: HandlerId,
}

impl EventKey {
    pub fn new(event: impl Into<String>, handler: HandlerId) -> Self {
        Self {
            event: event.into(),
            handler,
        }
    }
}

/// A named bundle of event handlers plus connection lifecycle hooks.
#[derive(Clone, Default)]
pub struct ModuleSpec {
    pub events: Vec<(String, EventHandler)>,
    pub on_connect: Vec<LifecycleHook>,
    pub on_disconnect: Vec<LifecycleHook>,
    pub on_reconnect: Vec<LifecycleHook>,
}

impl ModuleSpec {
    pub fn handle(mut self, event: impl Into<String>, handler: EventHandler) -> Self {
        self.events.push((event.into(), handler));
        self
    }

    pub fn on_connect(mut self, hook: LifecycleHook) -> Self {
        self.on_connect.push(hook);
        self
    }

    pub fn on_disconnect(mut self, hook: LifecycleHook) -> Self {
        self.on_disconnect.push(hook);
        self
    }

    pub fn on_reconnect(mut self, hook: LifecycleHook) -> Self {
        self.on_reconnect.push(hook);
        self
    }
}

struct RegisteredModule {
    keys: Vec<EventKey>,
    on_connect: Vec<LifecycleHook>,
    on_disconnect: Vec<LifecycleHook>,
    on_reconnect: Vec<LifecycleHook>,
}

#[derive(Clone, Copy)]
enum Lifecycle {
    Connect,
    Disconnect,
    Reconnect,
}

pub struct EventRouter {
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    modules: HashMap<String, RegisteredModule>,
    connected: bool,
    seen: VecDeque<u64>,
    seen_set: HashSet<u64>,
    dedupe_window: usize,
}

impl EventRouter {
    pub fn new(dedupe_window: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            modules: HashMap::new(),
            connected: false,
            seen: VecDeque::new(),
            seen_set: HashSet::new(),
            dedupe_window: dedupe_window.max(1),
        }
    }

    /// Registers `handler` for `event`. Returns false if this exact handler
    /// is already bound to the event.
    pub fn on(&mut self, event: &str, handler: EventHandler) -> bool {
        let id = HandlerId::of(&handler);
        let bound = self.handlers.entry(event.to_string()).or_default();
        if bound.iter().any(|(existing, _)| *existing == id) {
            debug!(event, "handler already registered");
            return false;
        }
        bound.push((id, handler));
        true
    }

    /// Drops every handler for `event`, including those owned by modules.
    pub fn off(&mut self, event: &str) -> Vec<EventKey> {
        let removed: Vec<EventKey> = self
            .handlers
            .remove(event)
            .unwrap_or_default()
            .into_iter()
            .map(|(id, _)| EventKey::new(event, id))
            .collect();
        for module in self.modules.values_mut() {
            module.keys.retain(|key| key.event != event);
        }
        removed
    }

    pub fn has_handlers(&self, event: &str) -> bool {
        self.handlers
            .get(event)
            .map(|bound| !bound.is_empty())
            .unwrap_or(false)
    }

    /// Registers a module's handlers and hooks. Returns the newly bound keys,
    /// or `None` when a module with this name already exists.
    pub fn register_module(&mut self, name: &str, spec: ModuleSpec) -> Option<Vec<EventKey>> {
        if self.modules.contains_key(name) {
            warn!(module = name, "module already registered");
            return None;
        }

        let mut keys = Vec::new();
        for (event, handler) in spec.events {
            let id = HandlerId::of(&handler);
            if self.on(&event, handler) {
                keys.push(EventKey::new(event, id));
            }
        }
        let module = RegisteredModule {
            keys: keys.clone(),
            on_connect: spec.on_connect,
            on_disconnect: spec.on_disconnect,
            on_reconnect: spec.on_reconnect,
        };
        if self.connected {
            run_hooks(name, &module.on_connect);
        }
        self.modules.insert(name.to_string(), module);
        Some(keys)
    }

    pub fn unregister_module(&mut self, name: &str) -> Option<Vec<EventKey>> {
        let module = self.modules.remove(name)?;
        for key in &module.keys {
            if let Some(bound) = self.handlers.get_mut(&key.event) {
                bound.retain(|(id, _)| *id != key.handler);
                if bound.is_empty() {
                    self.handlers.remove(&key.event);
                }
            }
        }
        Some(module.keys)
    }

    /// Remembers an authority event id. Returns false for an id already seen
    /// within the window; frames without an id are always accepted.
    pub fn accept(&mut self, event_id: Option<u64>) -> bool {
        let Some(event_id) = event_id else {
            return true;
        };
        if !self.seen_set.insert(event_id) {
            debug!(event_id, "dropping duplicate event");
            return false;
        }
        self.seen.push_back(event_id);
        while self.seen.len() > self.dedupe_window {
            if let Some(oldest) = self.seen.pop_front() {
                self.seen_set.remove(&oldest);
            }
        }
        true
    }

    /// Invokes every handler bound to `event`. A failing or panicking handler
    /// is logged and does not stop the others. Returns how many ran.
    pub fn dispatch(&self, event: &str, data: &Value) -> usize {
        let Some(bound) = self.handlers.get(event) else {
            return 0;
        };
        for (id, handler) in bound {
            match catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(event, handler = ?id, %error, "event handler failed"),
                Err(_) => warn!(event, handler = ?id, "event handler panicked"),
            }
        }
        bound.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        let stage = if connected {
            Lifecycle::Connect
        } else {
            Lifecycle::Disconnect
        };
        self.fire(stage);
    }

    pub fn notify_reconnect(&self) {
        self.fire(Lifecycle::Reconnect);
    }

    fn fire(&self, stage: Lifecycle) {
        for (name, module) in &self.modules {
            let hooks = match stage {
                Lifecycle::Connect => &module.on_connect,
                Lifecycle::Disconnect => &module.on_disconnect,
                Lifecycle::Reconnect => &module.on_reconnect,
            };
            run_hooks(name, hooks);
        }
    }
}

fn run_hooks(module: &str, hooks: &[LifecycleHook]) {
    for hook in hooks {
        if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
            warn!(module, "lifecycle hook panicked");
        }
    }
}
