//! # Realtime Pool
//!
//! Pooled, auto-reconnecting realtime channel connections that multiplex
//! many independent table-change subscribers onto one socket per backend
//! instance.
//!
//! ## Core Concepts
//!
//! - **Pool**: one managed connection per instance name, created on first
//!   subscribe and closed when its last subscriber leaves
//! - **Managed connection**: reconnects with exponential backoff, sends
//!   heartbeats, and rejoins every table after a reconnect
//! - **Multiplexing**: N subscribers on one table share a single channel
//!   join covering the union of their event types
//! - **Isolation**: a failing handler is logged and counted; its siblings
//!   still run
//!
//! ## Example
//!
//! ```ignore
//! use realtime_pool::{ConnectionPool, EventType, HandlerSet, InstanceDescriptor, PoolConfig};
//!
//! let pool = ConnectionPool::new(PoolConfig::default())?;
//! let instance = InstanceDescriptor::new("main", "https://db.example.com", "anon-key");
//!
//! pool.subscribe(
//!     &instance,
//!     "public",
//!     "users",
//!     [EventType::Insert],
//!     HandlerSet::new().on(EventType::Insert, |change| {
//!         println!("new user: {:?}", change.record);
//!         Ok(())
//!     }),
//!     "job-A",
//! )?;
//!
//! for (name, stats) in pool.stats() {
//!     println!("{name}: {stats}");
//! }
//!
//! pool.shutdown(std::time::Duration::from_secs(5))?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod subscriptions;
pub mod types;
pub mod wire;

// Re-exports
pub use config::{PoolConfig, ReconnectPolicy};
pub use connection::{ConnectionState, ConnectionStats};
pub use error::{HandlerError, RealtimeError, Result};
pub use pool::ConnectionPool;
pub use protocol::{ChangePayload, Envelope, ProtocolConfig};
pub use subscriptions::{channel, Callback, ChangeReceiver, ChannelCallback, HandlerSet};
pub use types::*;
pub use wire::{Connector, Frame, WebSocketConnector, WireEvent, WireLink};
