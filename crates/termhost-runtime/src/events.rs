//! Event bus: typed publish/subscribe between the runtime and its observers.
//!
//! Listeners are registered per [`EventKind`] and invoked synchronously by
//! [`EventBus::emit`], in subscription order, from whichever thread emits.
//! Delivery works on a snapshot of the listener list, so listeners may
//! subscribe or unsubscribe (themselves included) while being invoked.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::panic_message;

/// Kinds of events published by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CommandCompleted,
    CommandFailed,
    PluginLoaded,
    PluginEnabled,
    PluginDisabled,
    PluginUnloaded,
    ConfigChanged,
    ThemeRegistered,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [EventKind; 8] = [
        EventKind::CommandCompleted,
        EventKind::CommandFailed,
        EventKind::PluginLoaded,
        EventKind::PluginEnabled,
        EventKind::PluginDisabled,
        EventKind::PluginUnloaded,
        EventKind::ConfigChanged,
        EventKind::ThemeRegistered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CommandCompleted => "command_completed",
            EventKind::CommandFailed => "command_failed",
            EventKind::PluginLoaded => "plugin_loaded",
            EventKind::PluginEnabled => "plugin_enabled",
            EventKind::PluginDisabled => "plugin_disabled",
            EventKind::PluginUnloaded => "plugin_unloaded",
            EventKind::ConfigChanged => "config_changed",
            EventKind::ThemeRegistered => "theme_registered",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable event value with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a raw JSON payload.
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// Create a new event from one of the typed payload structs.
    ///
    /// A payload that fails to serialize is replaced by `null`.
    pub fn with_payload<P: Serialize>(kind: EventKind, payload: &P) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            tracing::warn!(event = %kind, "failed to serialize event payload: {e}");
            serde_json::Value::Null
        });
        Self::new(kind, payload)
    }

    /// Decode the payload into one of the typed payload structs.
    pub fn decode<P: for<'de> Deserialize<'de>>(&self) -> Option<P> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// ─── Event payload types ─────────────────────────────────────────────

/// Payload for `command_completed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandCompletedPayload {
    pub invocation_id: Uuid,
    pub command: String,
    pub stage: String,
    pub result: String,
}

/// Payload for `command_failed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFailedPayload {
    pub invocation_id: Uuid,
    pub command: String,
    pub stage: String,
    pub error: String,
}

/// Payload for `plugin_loaded`, `plugin_enabled`, `plugin_disabled` and
/// `plugin_unloaded` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLifecyclePayload {
    pub plugin: String,
    pub version: String,
    pub commands: Vec<String>,
}

/// Payload for `config_changed` events. Carries the complete mapping so
/// that hosts can persist it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChangedPayload {
    pub plugin: String,
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Payload for `theme_registered` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeRegisteredPayload {
    pub plugin: String,
    pub size_bytes: usize,
}

// ─── Bus ────────────────────────────────────────────────────────────────

/// A registered event callback.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe hub keyed by [`EventKind`].
pub struct EventBus {
    /// Event kind → listeners in subscription order.
    subscriptions: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        tracing::trace!(event = %kind, subscription = id.0, "listener subscribed");
        id
    }

    /// Remove a listener. Returns `false` when it was not subscribed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = subs.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        before != listeners.len()
    }

    /// Deliver an event to every listener subscribed to its kind.
    ///
    /// Listeners run outside the lock on a snapshot taken at the start of
    /// the call. A panicking listener is logged and skipped. Returns the
    /// number of listeners that completed.
    pub fn emit(&self, event: &Event) -> usize {
        let snapshot: Vec<(SubscriptionId, Listener)> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subs.get(&event.kind).cloned().unwrap_or_default()
        };

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    tracing::error!(
                        event = %event.kind,
                        subscription = id.0,
                        "event listener panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        delivered
    }

    /// Number of listeners currently subscribed to a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Box<dyn Fn(&Event) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |tag: &'static str| -> Box<dyn Fn(&Event) + Send + Sync> {
            let log = Arc::clone(&log_for_factory);
            Box::new(move |_event: &Event| log.lock().unwrap().push(tag.to_string()))
        };
        (log, factory)
    }

    // ── Event values ───────────────────────────────────────────────────

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::CommandCompleted.as_str(), "command_completed");
        assert_eq!(EventKind::PluginUnloaded.to_string(), "plugin_unloaded");
        assert_eq!(
            serde_json::to_value(EventKind::ConfigChanged).unwrap(),
            "config_changed"
        );
        assert_eq!(EventKind::ALL.len(), 8);
    }

    #[test]
    fn test_event_with_typed_payload() {
        let payload = PluginLifecyclePayload {
            plugin: "weather".into(),
            version: "1.0.0".into(),
            commands: vec!["forecast".into()],
        };
        let event = Event::with_payload(EventKind::PluginLoaded, &payload);
        assert_eq!(event.payload["plugin"], "weather");
        assert_eq!(event.decode::<PluginLifecyclePayload>(), Some(payload));
        assert!(event.decode::<CommandFailedPayload>().is_none());
    }

    // ── Delivery ───────────────────────────────────────────────────────

    #[test]
    fn test_emit_in_subscription_order() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        bus.subscribe(EventKind::PluginLoaded, listener("a"));
        bus.subscribe(EventKind::PluginLoaded, listener("b"));
        bus.subscribe(EventKind::PluginLoaded, listener("c"));
        bus.subscribe(EventKind::PluginUnloaded, listener("other"));

        let delivered = bus.emit(&Event::new(EventKind::PluginLoaded, serde_json::Value::Null));
        assert_eq!(delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(
            bus.emit(&Event::new(EventKind::ThemeRegistered, serde_json::Value::Null)),
            0
        );
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let (log, listener) = recorder();
        bus.subscribe(EventKind::CommandFailed, listener("first"));
        bus.subscribe(EventKind::CommandFailed, |_| panic!("listener exploded"));
        bus.subscribe(EventKind::CommandFailed, listener("third"));

        let delivered = bus.emit(&Event::new(EventKind::CommandFailed, serde_json::Value::Null));
        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn test_self_unsubscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let (log, listener) = recorder();
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let bus_in_listener = Arc::clone(&bus);
        let id_in_listener = Arc::clone(&own_id);
        let log_in_listener = Arc::clone(&log);
        let id = bus.subscribe(EventKind::CommandCompleted, move |_| {
            log_in_listener.lock().unwrap().push("once".into());
            if let Some(id) = *id_in_listener.lock().unwrap() {
                bus_in_listener.unsubscribe(EventKind::CommandCompleted, id);
            }
        });
        *own_id.lock().unwrap() = Some(id);
        bus.subscribe(EventKind::CommandCompleted, listener("after"));

        let event = Event::new(EventKind::CommandCompleted, serde_json::Value::Null);
        assert_eq!(bus.emit(&event), 2);
        assert_eq!(bus.emit(&event), 1);
        assert_eq!(*log.lock().unwrap(), vec!["once", "after", "after"]);
        assert_eq!(bus.subscriber_count(EventKind::CommandCompleted), 1);
    }

    #[test]
    fn test_subscribe_during_emit_applies_to_next_emit() {
        let bus = Arc::new(EventBus::new());
        let (log, listener) = recorder();
        let bus_in_listener = Arc::clone(&bus);
        let log_in_listener = Arc::clone(&log);
        bus.subscribe(EventKind::ConfigChanged, move |_| {
            let log = Arc::clone(&log_in_listener);
            bus_in_listener.subscribe(EventKind::ConfigChanged, move |_| {
                log.lock().unwrap().push("late".into())
            });
        });
        bus.subscribe(EventKind::ConfigChanged, listener("early"));

        let event = Event::new(EventKind::ConfigChanged, serde_json::Value::Null);
        assert_eq!(bus.emit(&event), 2);
        assert_eq!(*log.lock().unwrap(), vec!["early"]);
        assert_eq!(bus.subscriber_count(EventKind::ConfigChanged), 3);
    }

    // ── Subscription management ────────────────────────────────────────

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::PluginLoaded, |_| {});
        assert!(!bus.unsubscribe(EventKind::PluginUnloaded, id));
        assert!(bus.unsubscribe(EventKind::PluginLoaded, id));
        assert!(!bus.unsubscribe(EventKind::PluginLoaded, id));
        assert_eq!(bus.subscriber_count(EventKind::PluginLoaded), 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let bus = EventBus::new();
        for kind in EventKind::ALL {
            bus.subscribe(kind, |_| {});
        }
        bus.clear();
        for kind in EventKind::ALL {
            assert_eq!(bus.subscriber_count(kind), 0);
        }
    }

    #[test]
    fn test_emit_from_background_thread() {
        let bus = Arc::new(EventBus::new());
        let (log, listener) = recorder();
        bus.subscribe(EventKind::CommandCompleted, listener("bg"));

        let bus_for_thread = Arc::clone(&bus);
        std::thread::spawn(move || {
            bus_for_thread.emit(&Event::new(
                EventKind::CommandCompleted,
                serde_json::Value::Null,
            ))
        })
        .join()
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["bg"]);
    }
}
