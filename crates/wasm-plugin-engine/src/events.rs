//! Engine event bus.
//!
//! A small name-keyed listener registry the host application can subscribe
//! to for plugin lifecycle notifications. The engine publishes:
//!
//! - [`PLUGIN_REGISTERED`] — a manifest entered the registry
//! - [`PLUGIN_RESOLVED`] — all of a plugin's hooks and dependencies bound
//! - [`PLUGIN_INSTANTIATED`] — a sandbox went live and `start` was called
//!
//! Each event's payload is the `id@version` plugin key as UTF-8 bytes.
//! Dispatch is synchronous and always happens outside the registry lock, so
//! listeners may call back into the engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// A plugin manifest entered the registry.
pub const PLUGIN_REGISTERED: &str = "plugin.registered";
/// All of a plugin's hooks and dependencies are satisfied.
pub const PLUGIN_RESOLVED: &str = "plugin.resolved";
/// A plugin's sandbox instance went live.
pub const PLUGIN_INSTANTIATED: &str = "plugin.instantiated";

/// A named notification with an opaque payload.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub name: String,
    pub payload: Vec<u8>,
}

impl EngineEvent {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Callback invoked for every event published under a subscribed name.
pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Listener registry with synchronous fan-out.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for events published under `event_name`.
    pub fn subscribe(&self, event_name: impl Into<String>, listener: Listener) {
        self.listeners.write().entry(event_name.into()).or_default().push(listener);
    }

    /// Publish `event` to every listener subscribed to its name.
    ///
    /// Returns the number of listeners notified; zero listeners is not an
    /// error.
    pub fn emit(&self, event: &EngineEvent) -> usize {
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read();
            match listeners.get(&event.name) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };
        debug!(event = %event.name, listeners = targets.len(), "dispatching engine event");
        for listener in &targets {
            listener(event);
        }
        targets.len()
    }
}
