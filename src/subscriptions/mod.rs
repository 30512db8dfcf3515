//! Subscription bookkeeping and multiplexing.
//!
//! Many independent subscribers can watch the same table; they share one
//! upstream channel join. This module provides:
//! - per-connection registration, at most one entry per (table, subscriber)
//! - the join plan for a table (union of everybody's requested events)
//! - multiplexed callbacks that fan a change out to every interested
//!   subscriber, isolating failures
//!
//! # Example
//!
//! ```ignore
//! let (callback, changes) = subscriptions::channel(256);
//! let handlers = HandlerSet::new()
//!     .on(EventType::Insert, |change| {
//!         println!("new row: {:?}", change.record);
//!         Ok(())
//!     })
//!     .on_callback(EventType::Update, callback);
//!
//! pool.subscribe(&instance, "public", "users",
//!     [EventType::Insert, EventType::Update], handlers, "job-A")?;
//!
//! while let Ok(change) = changes.recv() {
//!     println!("updated: {:?}", change.record);
//! }
//! ```

mod multiplex;
mod registry;
mod types;

pub use multiplex::{Delivery, DispatchTable, JoinPlan, Multiplexed, Route};
pub use registry::{Removal, SubscriptionRegistry, Upsert};
pub use types::{channel, Callback, ChangeReceiver, ChannelCallback, HandlerSet, Subscription};
