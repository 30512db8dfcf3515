//! Process-wide pool of managed connections, keyed by instance name.

use crate::config::PoolConfig;
use crate::connection::{ConnectionStats, ManagedConnection};
use crate::error::{RealtimeError, Result};
use crate::scheduler::Scheduler;
use crate::subscriptions::{HandlerSet, Subscription};
use crate::types::{EventType, InstanceDescriptor, SubscriberId, TableKey};
use crate::wire::{Connector, WebSocketConnector};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The connection pool.
///
/// Construct one per process (or per test) and share it by reference. A
/// managed connection is created lazily on the first subscribe for an
/// instance name and closed as soon as its last subscriber leaves.
pub struct ConnectionPool {
    /// Sharded by instance name; no global lock.
    connections: DashMap<String, ManagedConnection>,

    config: Arc<PoolConfig>,

    connector: Arc<dyn Connector>,

    /// Shared by every connection for I/O, reconnects and heartbeats.
    scheduler: Scheduler,

    shut_down: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool that connects over websockets.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let connector = Arc::new(WebSocketConnector::new(&config));
        Self::with_connector(config, connector)
    }

    /// Create a pool with a custom transport.
    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.scheduler_threads)?;
        Ok(Self {
            connections: DashMap::new(),
            config: Arc::new(config),
            connector,
            scheduler,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribe `subscriber_id` to changes on `schema.table`.
    ///
    /// Returns once the subscription is recorded; the join goes out when
    /// the instance's connection is (or becomes) connected. A repeated
    /// call with the same subscriber id on the same table replaces the
    /// earlier subscription.
    ///
    /// Only configuration problems are reported here. Connection failures
    /// are retried in the background and show up in [`stats`](Self::stats).
    pub fn subscribe(
        &self,
        descriptor: &InstanceDescriptor,
        schema: &str,
        table: &str,
        events: impl IntoIterator<Item = EventType>,
        handlers: HandlerSet,
        subscriber_id: impl Into<SubscriberId>,
    ) -> Result<()> {
        self.ensure_running()?;
        descriptor.validate()?;
        let key = TableKey::new(schema, table)?;
        let subscriber_id = subscriber_id.into();
        if subscriber_id.as_str().trim().is_empty() {
            return Err(RealtimeError::Configuration(
                "subscriber id must not be empty".to_string(),
            ));
        }
        let subscription = Subscription::new(subscriber_id, key, events, handlers);
        if subscription.events.is_empty() {
            return Err(RealtimeError::Configuration(format!(
                "no event types requested for {}",
                subscription.key
            )));
        }

        // The shard stays locked until the subscription is recorded, so a
        // concurrent unsubscribe cannot close the connection in between.
        let mut created = false;
        let connection = self
            .connections
            .entry(descriptor.name.clone())
            .or_insert_with(|| {
                info!(instance = %descriptor.name, url = %descriptor.base_url, "creating managed connection");
                created = true;
                ManagedConnection::new(
                    descriptor.clone(),
                    self.config.clone(),
                    self.connector.clone(),
                    self.scheduler.clone(),
                )
            });
        if !created && connection.descriptor().base_url != descriptor.base_url {
            warn!(
                instance = %descriptor.name,
                live = %connection.descriptor().base_url,
                requested = %descriptor.base_url,
                "instance already connected to a different URL; keeping the live connection"
            );
        }
        connection.subscribe(subscription);
        if created {
            connection.start();
        }
        Ok(())
    }

    /// Remove a subscription. Returns `Ok(false)` if nothing matched.
    ///
    /// When the instance's last subscriber leaves, its connection is
    /// closed and removed from the pool.
    pub fn unsubscribe(
        &self,
        instance: &str,
        schema: &str,
        table: &str,
        subscriber_id: &str,
    ) -> Result<bool> {
        self.ensure_running()?;
        let key = TableKey::new(schema, table)?;
        let subscriber = SubscriberId::from(subscriber_id);

        let entry = match self.connections.entry(instance.to_string()) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(_) => return Ok(false),
        };
        let removed = entry.get().unsubscribe(&key, &subscriber);
        if entry.get().subscriber_count() == 0 {
            let connection = entry.remove();
            // The writer flushes in the background.
            let _ = connection.close();
            info!(instance, "last subscriber left; connection removed");
        }
        Ok(removed)
    }

    /// Snapshot of every live connection. Never waits on the network.
    pub fn stats(&self) -> HashMap<String, ConnectionStats> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Subscribers on `instance`, or 0 if it has no connection.
    pub fn subscriber_count(&self, instance: &str) -> usize {
        self.connections
            .get(instance)
            .map(|connection| connection.subscriber_count())
            .unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Close every connection and stop the scheduler. Waits up to
    /// `timeout` for each socket to write its leaves and close frame, then
    /// cancels whatever is still running. Idempotent.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let started = Instant::now();
        let names: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        let mut flushing = Vec::new();
        for name in names {
            if let Some((_, connection)) = self.connections.remove(&name) {
                flushing.extend(connection.close());
                closed += 1;
            }
        }
        if !flushing.is_empty() {
            let pending = flushing.len();
            let drained = async {
                join_all(flushing).await;
            };
            if !self.scheduler.block_on_timeout(timeout, drained) {
                warn!(pending, ?timeout, "sockets not flushed before shutdown timeout");
            }
        }
        self.scheduler
            .shutdown(timeout.saturating_sub(started.elapsed()));
        info!(connections = closed, "connection pool shut down");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(RealtimeError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            let _ = self.shutdown(self.config.shutdown_timeout);
        }
    }
}
