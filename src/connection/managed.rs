//! One shared, auto-reconnecting channel connection per backend instance.
//!
//! A managed connection owns the wire client for its instance and the
//! registry of every subscription riding on it. It drives the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--- backoff --+-------------+   (failure / close, subscribers left)
//!      |
//!      +-> Error  (attempts exhausted; a fresh subscribe restarts)
//! ```
//!
//! and reissues one multiplexed join per table whenever it (re)connects or
//! membership changes.
//!
//! Locks are always taken in the order registry -> client/routes/tasks ->
//! state; handlers run without any lock held.

use super::state::{ConnectionState, ConnectionStats, Counters};
use crate::config::PoolConfig;
use crate::error::RealtimeError;
use crate::protocol::{ChangePayload, Envelope, InboundMessage, ProtocolConfig, RefCounter};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::subscriptions::{DispatchTable, Removal, Subscription, SubscriptionRegistry, Upsert};
use crate::types::{InstanceDescriptor, SubscriberId, TableKey, Timestamp};
use crate::wire::{Connector, Frame, WireClient, WireEvent, WireLink};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Handle owned by the pool. Dropping it closes the connection.
pub(crate) struct ManagedConnection {
    inner: Arc<Inner>,
}

struct Inner {
    descriptor: InstanceDescriptor,
    config: Arc<PoolConfig>,
    protocol: Arc<ProtocolConfig>,
    connector: Arc<dyn Connector>,
    scheduler: Scheduler,
    /// Outlives individual sockets so refs are never reused.
    refs: Arc<RefCounter>,

    state: RwLock<ConnectionState>,
    connected_since: RwLock<Option<Timestamp>>,
    registry: Mutex<SubscriptionRegistry>,
    /// Routing snapshot used by the I/O worker.
    routes: RwLock<Arc<DispatchTable>>,
    client: Mutex<Option<WireClient>>,
    tasks: Mutex<Tasks>,

    /// Mirror of the registry's subscriber count for lock-free stats.
    subscriber_count: AtomicUsize,
    counters: Counters,
    reconnect_attempts: AtomicU32,
    reconnect_pending: AtomicBool,
    ever_connected: AtomicBool,
    /// Set once by a deliberate teardown; suppresses reconnects.
    closing: AtomicBool,
    /// Bumped per connect attempt and on close; stale link events are
    /// ignored.
    generation: AtomicU64,
}

#[derive(Default)]
struct Tasks {
    io: Option<TaskHandle>,
    reconnect: Option<TaskHandle>,
    heartbeat: Option<TaskHandle>,
}

impl Tasks {
    fn cancel_all(&mut self) {
        for task in [self.io.take(), self.reconnect.take(), self.heartbeat.take()]
            .into_iter()
            .flatten()
        {
            task.cancel();
        }
    }
}

impl ManagedConnection {
    /// Create an idle connection. Nothing happens on the wire until
    /// [`start`](Self::start).
    pub fn new(
        descriptor: InstanceDescriptor,
        config: Arc<PoolConfig>,
        connector: Arc<dyn Connector>,
        scheduler: Scheduler,
    ) -> Self {
        let protocol = Arc::new(config.protocol.clone());
        let inner = Arc::new(Inner {
            descriptor,
            config,
            protocol,
            connector,
            scheduler,
            refs: Arc::new(RefCounter::new()),
            state: RwLock::new(ConnectionState::Disconnected),
            connected_since: RwLock::new(None),
            registry: Mutex::new(SubscriptionRegistry::new()),
            routes: RwLock::new(Arc::new(DispatchTable::default())),
            client: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            subscriber_count: AtomicUsize::new(0),
            counters: Counters::default(),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_pending: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });
        Self { inner }
    }

    /// Begin connecting in the background.
    pub fn start(&self) {
        self.inner.connect();
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.inner.descriptor
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count.load(Ordering::Acquire)
    }

    /// Record `subscription`, replacing the subscriber's earlier entry on
    /// the same table. Rejoins the table if connected; restarts the
    /// connection cycle if it had given up.
    pub fn subscribe(&self, subscription: Subscription) {
        let inner = &self.inner;
        let key = subscription.key.clone();
        let subscriber = subscription.subscriber_id.clone();
        let events = subscription.events.clone();

        let state = {
            let mut registry = inner.registry.lock();
            let outcome = registry.upsert(subscription);
            inner.sync_membership(&registry);
            let state = *inner.state.read();
            if state == ConnectionState::Connected {
                inner.rejoin_table(&registry, &key);
            }
            info!(
                instance = %inner.descriptor.name,
                subscriber = %subscriber,
                table = %key,
                ?events,
                replaced = outcome == Upsert::Replaced,
                "subscribed"
            );
            state
        };

        if state == ConnectionState::Error {
            inner.restart();
        }
    }

    /// Remove `subscriber` from `key`. Returns false if there was no such
    /// subscription.
    pub fn unsubscribe(&self, key: &TableKey, subscriber: &SubscriberId) -> bool {
        let inner = &self.inner;
        let mut registry = inner.registry.lock();
        match registry.remove(key, subscriber) {
            Removal::NotFound => false,
            Removal::Removed { table_empty } => {
                inner.sync_membership(&registry);
                if *inner.state.read() == ConnectionState::Connected {
                    inner.rejoin_table(&registry, key);
                }
                info!(
                    instance = %inner.descriptor.name,
                    subscriber = %subscriber,
                    table = %key,
                    table_empty,
                    "unsubscribed"
                );
                true
            }
        }
    }

    /// Non-blocking snapshot; never touches the registry or the socket.
    pub fn stats(&self) -> ConnectionStats {
        let inner = &self.inner;
        ConnectionStats {
            instance_name: inner.descriptor.name.clone(),
            state: *inner.state.read(),
            connected_since: *inner.connected_since.read(),
            events_received: inner.counters.events_received.load(Ordering::Relaxed),
            events_failed: inner.counters.events_failed.load(Ordering::Relaxed),
            reconnections: inner.counters.reconnections.load(Ordering::Relaxed),
            subscriber_count: inner.subscriber_count.load(Ordering::Acquire),
        }
    }

    /// Deliberate teardown: leave every channel, close the socket, cancel
    /// scheduled tasks. No reconnect follows. Idempotent.
    ///
    /// Returns a future that resolves once the leaves and the close frame
    /// have been written, if a socket was open.
    pub fn close(&self) -> Option<BoxFuture<'static, ()>> {
        let inner = &self.inner;
        let mut registry = inner.registry.lock();
        if inner.closing.swap(true, Ordering::AcqRel) {
            return None;
        }
        inner.generation.fetch_add(1, Ordering::AcqRel);
        inner.tasks.lock().cancel_all();

        let tables = registry.clear();
        inner.sync_membership(&registry);
        let flushed = inner.client.lock().take().map(|client| {
            for key in &tables {
                if let Err(e) = client.leave(key) {
                    debug!(instance = %inner.descriptor.name, table = %key, error = %e, "leave failed during close");
                }
            }
            client.close();
            Box::pin(client.flushed()) as BoxFuture<'static, ()>
        });
        drop(registry);

        *inner.state.write() = ConnectionState::Disconnected;
        *inner.connected_since.write() = None;
        info!(instance = %inner.descriptor.name, tables = tables.len(), "connection closed");
        flushed
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Inner {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Publish the subscriber count and a fresh routing snapshot.
    fn sync_membership(&self, registry: &SubscriptionRegistry) {
        self.subscriber_count
            .store(registry.subscriber_count(), Ordering::Release);
        *self.routes.write() = Arc::new(registry.dispatch_table());
    }

    /// Start a connect attempt unless one is running or we are connected.
    fn connect(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        {
            let mut state = self.state.write();
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Connected) {
                debug!(instance = %self.descriptor.name, state = %*state, "connect skipped");
                return;
            }
            *state = ConnectionState::Connecting;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(instance = %self.descriptor.name, generation, "connecting");

        let connecting = self.connector.connect(&self.descriptor);
        let worker = run_link(Arc::downgrade(self), generation, connecting);
        match self.scheduler.spawn(worker) {
            Ok(handle) => {
                if let Some(previous) = self.tasks.lock().io.replace(handle) {
                    previous.cancel();
                }
            }
            Err(e) => {
                warn!(instance = %self.descriptor.name, error = %e, "cannot start connection worker");
                *self.state.write() = ConnectionState::Disconnected;
            }
        }
    }

    /// Leave the `Error` state and try again from scratch.
    fn restart(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if *state != ConnectionState::Error {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        self.reconnect_attempts.store(0, Ordering::Release);
        info!(instance = %self.descriptor.name, "restarting connection after giving up");
        self.connect();
    }

    /// Handshake succeeded. Returns false if the link is stale and was
    /// closed instead.
    fn on_open(self: &Arc<Self>, generation: u64, outbound: mpsc::UnboundedSender<Frame>) -> bool {
        let registry = self.registry.lock();
        if self.is_closing() || self.current_generation() != generation {
            let _ = outbound.send(Frame::Close);
            return false;
        }

        *self.client.lock() = Some(WireClient::new(
            outbound,
            self.refs.clone(),
            self.protocol.clone(),
        ));
        *self.state.write() = ConnectionState::Connected;
        *self.connected_since.write() = Some(Timestamp::now());
        self.reconnect_attempts.store(0, Ordering::Release);
        let reconnected = self.ever_connected.swap(true, Ordering::AcqRel);
        if reconnected {
            self.counters.record_reconnection();
        }
        info!(
            instance = %self.descriptor.name,
            reconnected,
            tables = registry.table_count(),
            subscribers = registry.subscriber_count(),
            "connected"
        );

        self.resubscribe_all(&registry);
        self.start_heartbeat(generation);
        true
    }

    /// Handshake failed.
    fn on_connect_failed(self: &Arc<Self>, generation: u64, error: &RealtimeError) {
        if self.is_closing() || self.current_generation() != generation {
            return;
        }
        warn!(instance = %self.descriptor.name, error = %error, "connection attempt failed");
        *self.state.write() = ConnectionState::Disconnected;
        if self.subscriber_count.load(Ordering::Acquire) == 0 {
            info!(instance = %self.descriptor.name, "no subscribers; not retrying");
            return;
        }
        self.schedule_reconnect();
    }

    /// The socket went away.
    fn on_closed(self: &Arc<Self>, generation: u64, remote: bool, reason: &str) {
        if self.current_generation() != generation {
            return;
        }
        self.client.lock().take();
        if let Some(heartbeat) = self.tasks.lock().heartbeat.take() {
            heartbeat.cancel();
        }
        *self.state.write() = ConnectionState::Disconnected;
        *self.connected_since.write() = None;

        if self.is_closing() {
            debug!(instance = %self.descriptor.name, "socket closed during teardown");
            return;
        }
        if self.subscriber_count.load(Ordering::Acquire) == 0 {
            info!(instance = %self.descriptor.name, reason, "socket closed with no subscribers; not reconnecting");
            return;
        }
        warn!(instance = %self.descriptor.name, remote, reason, "connection lost");
        self.schedule_reconnect();
    }

    /// Schedule one reconnect with exponential backoff, or give up once
    /// the attempt ceiling is exceeded. At most one reconnect is pending.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::AcqRel) {
            debug!(instance = %self.descriptor.name, "reconnect already scheduled");
            return;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let policy = &self.config.reconnect;
        if !policy.allows(attempt) {
            self.reconnect_pending.store(false, Ordering::Release);
            *self.state.write() = ConnectionState::Error;
            error!(
                instance = %self.descriptor.name,
                attempts = policy.max_attempts,
                "reconnect attempts exhausted; giving up"
            );
            return;
        }

        let delay = policy.delay_for_attempt(attempt);
        info!(
            instance = %self.descriptor.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let weak = Arc::downgrade(self);
        let task = self.scheduler.schedule_once(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_pending.store(false, Ordering::Release);
                inner.connect();
            }
        });
        match task {
            Ok(handle) => {
                if let Some(previous) = self.tasks.lock().reconnect.replace(handle) {
                    previous.cancel();
                }
            }
            Err(e) => {
                self.reconnect_pending.store(false, Ordering::Release);
                warn!(instance = %self.descriptor.name, error = %e, "cannot schedule reconnect");
            }
        }
    }

    fn start_heartbeat(self: &Arc<Self>, generation: u64) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = self
            .scheduler
            .schedule_every(self.config.heartbeat_interval, move || {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                if inner.is_closing() || inner.current_generation() != generation {
                    return ControlFlow::Break(());
                }
                inner.send_heartbeat();
                ControlFlow::Continue(())
            });
        match task {
            Ok(handle) => {
                if let Some(previous) = self.tasks.lock().heartbeat.replace(handle) {
                    previous.cancel();
                }
            }
            Err(e) => warn!(instance = %self.descriptor.name, error = %e, "cannot start heartbeat"),
        }
    }

    fn send_heartbeat(&self) {
        if let Some(client) = self.client.lock().as_ref() {
            match client.heartbeat() {
                Ok(reference) => trace!(instance = %self.descriptor.name, %reference, "heartbeat"),
                Err(e) => warn!(instance = %self.descriptor.name, error = %e, "heartbeat failed"),
            }
        }
    }

    /// Issue one join per subscribed table with the union of its events.
    fn resubscribe_all(&self, registry: &SubscriptionRegistry) {
        let plans = registry.join_plans();
        let client = self.client.lock();
        let Some(client) = client.as_ref() else {
            return;
        };
        for plan in &plans {
            match client.join(&plan.key, &plan.events) {
                Ok(reference) => debug!(
                    instance = %self.descriptor.name,
                    table = %plan.key,
                    events = ?plan.events,
                    %reference,
                    "joined"
                ),
                Err(e) => warn!(
                    instance = %self.descriptor.name,
                    table = %plan.key,
                    error = %e,
                    "join failed"
                ),
            }
        }
        info!(instance = %self.descriptor.name, channels = plans.len(), "resubscribed all channels");
    }

    /// Bring one table's live join in line with the registry: rejoin with
    /// the current union, or leave if nobody is left.
    fn rejoin_table(&self, registry: &SubscriptionRegistry, key: &TableKey) {
        let client = self.client.lock();
        let Some(client) = client.as_ref() else {
            return;
        };
        let result = match registry.join_plan(key) {
            Some(plan) => client.join(&plan.key, &plan.events),
            None => client.leave(key),
        };
        if let Err(e) = result {
            warn!(instance = %self.descriptor.name, table = %key, error = %e, "channel update failed");
        }
    }

    /// Decode one inbound frame and route it. Malformed frames are dropped.
    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(instance = %self.descriptor.name, error = %e, "dropping malformed message");
                return;
            }
        };
        match InboundMessage::decode(envelope, &self.protocol) {
            Ok(InboundMessage::Change { key, change }) => self.deliver(&key, &change),
            Ok(InboundMessage::Reply { topic, reference, status }) => {
                if status == "ok" {
                    trace!(instance = %self.descriptor.name, topic, ?reference, "reply ok");
                } else {
                    warn!(instance = %self.descriptor.name, topic, ?reference, status, "channel request rejected");
                }
            }
            Ok(InboundMessage::ChannelError { topic }) => {
                warn!(instance = %self.descriptor.name, topic, "channel error");
            }
            Ok(InboundMessage::ChannelClosed { topic }) => {
                debug!(instance = %self.descriptor.name, topic, "channel closed by server");
            }
            Ok(InboundMessage::Unknown { topic, event }) => {
                trace!(instance = %self.descriptor.name, topic, event, "ignoring message");
            }
            Err(e) => {
                warn!(instance = %self.descriptor.name, error = %e, "dropping undecodable message");
            }
        }
    }

    fn deliver(&self, key: &TableKey, change: &ChangePayload) {
        let routes = self.routes.read().clone();
        let Some(multiplexed) = routes.get(key, change.event) else {
            debug!(instance = %self.descriptor.name, table = %key, event = %change.event, "no subscriber for change");
            return;
        };
        // Handlers may block; keep the runtime's other tasks moving.
        let outcome = tokio::task::block_in_place(|| multiplexed.deliver(change));
        self.counters.record_delivery(outcome.failed);
    }
}

/// I/O worker for one connect attempt: handshake, then decode and dispatch
/// inbound frames in order until the socket closes.
async fn run_link(
    weak: Weak<Inner>,
    generation: u64,
    connecting: BoxFuture<'static, crate::error::Result<WireLink>>,
) {
    let outcome = connecting.await;
    let mut inbound = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match outcome {
            Ok(WireLink { outbound, inbound }) => {
                if !inner.on_open(generation, outbound) {
                    return;
                }
                inbound
            }
            Err(e) => {
                inner.on_connect_failed(generation, &e);
                return;
            }
        }
    };

    loop {
        let event = inbound.recv().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.current_generation() != generation {
            return;
        }
        match event {
            Some(WireEvent::Message(text)) => inner.dispatch(&text),
            Some(WireEvent::Error(reason)) => {
                warn!(instance = %inner.descriptor.name, reason, "transport error");
            }
            Some(WireEvent::Closed { remote, reason }) => {
                inner.on_closed(generation, remote, &reason);
                return;
            }
            None => {
                inner.on_closed(generation, true, "transport ended");
                return;
            }
        }
    }
}
