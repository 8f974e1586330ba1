//! EventBus - synchronous, ordered fan-out of `WorkerEvent`s.
//!
//! `publish` returns only after every listener has run, in the order the
//! listeners were registered. The worker loop relies on this: a listener that
//! calls `request_stop` on `job.released` is guaranteed to be seen before the
//! next reservation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::error;

use crate::domain::WorkerEvent;
use crate::ports::{ChannelSink, EventSink};

#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Register a closure as a listener.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(listener));
    }

    /// Register a listener that forwards every event into a channel.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (sink, rx) = ChannelSink::new();
        self.subscribe(Arc::new(sink));
        rx
    }

    pub fn listener_count(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn publish(&self, event: &WorkerEvent) {
        // snapshot, so a listener may subscribe another one without deadlocking
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().clone();

        for (idx, sink) in sinks.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| sink.on_event(event))).is_err() {
                error!(listener = idx, event = event.name(), "event listener panicked");
            }
        }
    }
}
