//!
//! Thread-safe subscribe/dispatch registry for `HostEvent`s.
//!

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::events::{DeviceEventKind, HostEvent};

/// A handler invoked with a dispatched event. `Arc` rather than `Box` so `dispatch`
/// can clone the matching handlers out of the subscription list and invoke them
/// after releasing the lock; `Send + Sync` since dispatch may run on whichever task
/// observed the event.
pub type Handler = Arc<dyn Fn(&HostEvent) + Send + Sync>;

///
/// Selects which events a subscription receives, replacing the reflective
/// `isinstance` base-class fan-out this protocol layer's source relies on with an
/// explicit, fixed set of categories.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Every event, including `HostException`.
    All,
    /// Every `DeviceEvent`, of any kind.
    Device,
    /// Only `DeviceEvent`s of one specific kind.
    Specific(DeviceEventKind),
}

impl Category {
    fn matches(&self, event: &HostEvent) -> bool {
        match (self, event) {
            (Category::All, _) => true,
            (Category::Device, HostEvent::Device(_)) => true,
            (Category::Specific(kind), HostEvent::Device(device_event)) => *kind == device_event.kind(),
            _ => false,
        }
    }
}

///
/// Opaque handle returned by `subscribe`, used to `unsubscribe` later.
///
/// Closures have no stable identity to compare against in Rust the way the source's
/// bound methods do, so subscriptions are tracked by a monotonic id instead.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    category: Category,
    handler: Handler,
}

///
/// Dispatches events to registered handlers.
///
/// Handlers can be registered for `Category::All`, `Category::Device`, or a single
/// `DeviceEventKind`. `subscribe`, `unsubscribe`, and `dispatch` are serialized by a
/// mutex; handlers are invoked outside the lock, in registration order, and a
/// handler that panics is caught so its siblings still run.
///
pub struct EventDispatcher {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher { subscriptions: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    ///
    /// Registers a handler for the given category.
    ///
    /// # Returns
    /// A `SubscriptionId` that can later be passed to `unsubscribe`.
    ///
    pub fn subscribe(&self, category: Category, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.push(Subscription { id, category, handler });
        id
    }

    ///
    /// Unregisters a previously registered handler.
    ///
    /// A no-op if `id` is not currently registered (already unsubscribed, or never
    /// valid).
    ///
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.retain(|subscription| subscription.id != id);
    }

    ///
    /// Dispatches an event to every handler whose category matches.
    ///
    /// Matching handlers are cloned out of the subscription list before the lock is
    /// released, so a handler that calls back into `subscribe`/`unsubscribe`, or
    /// triggers a re-entrant `dispatch`, cannot deadlock on the subscription mutex.
    ///
    pub fn dispatch(&self, event: &HostEvent) {
        let targets: Vec<Handler> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .filter(|subscription| subscription.category.matches(event))
                .map(|subscription| subscription.handler.clone())
                .collect()
        };

        for handler in targets {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event))) {
                tracing::error!(message = panic_message(&*panic), "event handler panicked");
            }
        }
    }
}

/// Best-effort extraction of a human-readable message from a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
