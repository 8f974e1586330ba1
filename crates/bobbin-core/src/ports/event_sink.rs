//! EventSink port - a listener on the worker's event bus.
//!
//! Sinks are called synchronously, in registration order, while the worker
//! loop waits. They must return promptly.

use tokio::sync::mpsc;

use crate::domain::WorkerEvent;

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &WorkerEvent);
}

impl<F> EventSink for F
where
    F: Fn(&WorkerEvent) + Send + Sync,
{
    fn on_event(&self, event: &WorkerEvent) {
        self(event)
    }
}

/// Forwards every event into an unbounded channel.
///
/// Sending never blocks, so async consumers can drain the receiver at
/// their own pace without holding up the worker.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: &WorkerEvent) {
        // receiver dropped: nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}
