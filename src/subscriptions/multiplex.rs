//! Fan-out of one upstream channel to many subscribers.

use super::types::Callback;
use crate::protocol::ChangePayload;
use crate::types::{EventType, SubscriberId, TableKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// The join to issue for one table: the union of every subscriber's
/// requested events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinPlan {
    pub key: TableKey,
    pub events: BTreeSet<EventType>,
}

/// One subscriber's callback for one event.
#[derive(Clone)]
pub struct Route {
    pub subscriber_id: SubscriberId,
    pub callback: Arc<dyn Callback>,
}

/// Outcome of delivering one change to every route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Multiplexed callback for one (table, event): runs every subscriber's
/// handler in registration order.
#[derive(Clone, Default)]
pub struct Multiplexed {
    routes: Vec<Route>,
}

impl Multiplexed {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriberId> {
        self.routes.iter().map(|route| &route.subscriber_id)
    }

    /// Invoke every handler. A failing or panicking handler is logged and
    /// counted; the remaining handlers still run.
    pub fn deliver(&self, change: &ChangePayload) -> Delivery {
        let mut outcome = Delivery::default();
        for route in &self.routes {
            let result = catch_unwind(AssertUnwindSafe(|| route.callback.on_change(change)));
            match result {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    error!(
                        subscriber = %route.subscriber_id,
                        table = %change.table,
                        event = %change.event,
                        error = %e,
                        "subscriber handler failed"
                    );
                }
                Err(_) => {
                    outcome.failed += 1;
                    error!(
                        subscriber = %route.subscriber_id,
                        table = %change.table,
                        event = %change.event,
                        "subscriber handler panicked"
                    );
                }
            }
        }
        outcome
    }
}

/// Immutable routing snapshot: (table, event) -> multiplexed callback.
///
/// Rebuilt whenever membership changes; the I/O worker dispatches from a
/// shared snapshot without touching the registry.
#[derive(Clone, Default)]
pub struct DispatchTable {
    tables: HashMap<TableKey, BTreeMap<EventType, Multiplexed>>,
}

impl DispatchTable {
    pub(crate) fn insert(&mut self, key: TableKey, event: EventType, multiplexed: Multiplexed) {
        self.tables.entry(key).or_default().insert(event, multiplexed);
    }

    pub fn get(&self, key: &TableKey, event: EventType) -> Option<&Multiplexed> {
        self.tables.get(key)?.get(&event)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
