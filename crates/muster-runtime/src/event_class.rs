//! Event classes: subscription and fanout

use crate::federate::Federate;
use muster_value::Value;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

/// A named event on one federate.
///
/// Dispatching posts the event to every other federate in the federation;
/// each receiver runs its subscribers in dispatch order on its own strand.
pub struct EventClass {
    federate: Weak<Federate>,
    name: String,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventClass {
    pub(crate) fn new(federate: Weak<Federate>, name: impl Into<String>) -> Self {
        Self {
            federate,
            name: name.into(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The event name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a subscriber invoked for each dispatched event
    pub fn subscribe(&self, subscriber: impl Fn(&Value) + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(subscriber));
    }

    pub(crate) fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.lock().clone()
    }

    /// Dispatch the event to every other federate in the federation
    pub fn dispatch(&self, params: Value, delay: f64) {
        if let Some(federate) = self.federate.upgrade() {
            federate.dispatch_event(&self.name, params, delay, 0.0);
        }
    }
}
