//! Subscriber-facing types: callbacks and subscriptions.

use crate::error::HandlerError;
use crate::protocol::ChangePayload;
use crate::types::{EventType, SubscriberId, TableKey};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Receives row changes for one subscriber.
///
/// Returning an error marks the delivery as failed; it is logged and
/// counted, and never affects other subscribers.
pub trait Callback: Send + Sync {
    fn on_change(&self, change: &ChangePayload) -> Result<(), HandlerError>;
}

impl<F> Callback for F
where
    F: Fn(&ChangePayload) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_change(&self, change: &ChangePayload) -> Result<(), HandlerError> {
        self(change)
    }
}

/// Per-event callbacks of one subscriber.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: BTreeMap<EventType, Arc<dyn Callback>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `event`, replacing any earlier handler.
    pub fn on<F>(self, event: EventType, handler: F) -> Self
    where
        F: Fn(&ChangePayload) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.on_callback(event, handler)
    }

    /// Register any [`Callback`] implementation for `event`.
    pub fn on_callback<C>(mut self, event: EventType, callback: C) -> Self
    where
        C: Callback + 'static,
    {
        self.handlers.insert(event, Arc::new(callback));
        self
    }

    /// Register an already shared callback.
    pub fn on_shared(mut self, event: EventType, callback: Arc<dyn Callback>) -> Self {
        self.handlers.insert(event, callback);
        self
    }

    pub fn get(&self, event: EventType) -> Option<&Arc<dyn Callback>> {
        self.handlers.get(&event)
    }

    pub fn events(&self) -> impl Iterator<Item = EventType> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// One subscriber's interest in one table.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub key: TableKey,
    pub events: BTreeSet<EventType>,
    pub handlers: HandlerSet,
}

impl Subscription {
    pub fn new(
        subscriber_id: SubscriberId,
        key: TableKey,
        events: impl IntoIterator<Item = EventType>,
        handlers: HandlerSet,
    ) -> Self {
        Self {
            subscriber_id,
            key,
            events: events.into_iter().collect(),
            handlers,
        }
    }

    /// The callback to run for `event`, if this subscriber asked for it.
    pub fn handler_for(&self, event: EventType) -> Option<&Arc<dyn Callback>> {
        if self.events.contains(&event) {
            self.handlers.get(event)
        } else {
            None
        }
    }
}

/// Callback that forwards changes into a bounded channel.
///
/// Use with [`channel`] when the consumer prefers pulling changes from a
/// queue over running code on the connection's I/O worker.
pub struct ChannelCallback {
    sender: crossbeam_channel::Sender<ChangePayload>,
}

impl Callback for ChannelCallback {
    fn on_change(&self, change: &ChangePayload) -> Result<(), HandlerError> {
        match self.sender.try_send(change.clone()) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                Err(HandlerError::new("change buffer is full"))
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                Err(HandlerError::new("change receiver was dropped"))
            }
        }
    }
}

/// Receiving end of a [`ChannelCallback`].
pub struct ChangeReceiver {
    receiver: crossbeam_channel::Receiver<ChangePayload>,
}

impl ChangeReceiver {
    /// Receive the next change (blocking).
    pub fn recv(&self) -> Result<ChangePayload, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a change (non-blocking).
    pub fn try_recv(&self) -> Result<ChangePayload, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ChangePayload, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Create a channel-backed callback holding at most `buffer` changes.
///
/// A `buffer` of zero is raised to one. Delivery never blocks, so a
/// rendezvous channel would reject every change.
pub fn channel(buffer: usize) -> (ChannelCallback, ChangeReceiver) {
    let (sender, receiver) = crossbeam_channel::bounded(buffer.max(1));
    (ChannelCallback { sender }, ChangeReceiver { receiver })
}
