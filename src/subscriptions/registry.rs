//! Per-connection registry of table subscriptions.

use super::multiplex::{DispatchTable, JoinPlan, Multiplexed, Route};
use super::types::Subscription;
use crate::types::{EventType, SubscriberId, TableKey};
use std::collections::{BTreeMap, BTreeSet};

/// Result of [`SubscriptionRegistry::upsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// The subscriber already had an entry on this table; it was replaced.
    Replaced,
}

/// Result of [`SubscriptionRegistry::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    NotFound,
    /// `table_empty` is true when this was the table's last subscriber.
    Removed { table_empty: bool },
}

/// Maps each table to its active subscriptions, at most one per subscriber.
///
/// Not synchronised; the owning connection serialises access.
#[derive(Default)]
pub struct SubscriptionRegistry {
    tables: BTreeMap<TableKey, Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription, replacing the subscriber's previous entry on the
    /// same table in place.
    pub fn upsert(&mut self, subscription: Subscription) -> Upsert {
        let subs = self.tables.entry(subscription.key.clone()).or_default();
        match subs
            .iter_mut()
            .find(|s| s.subscriber_id == subscription.subscriber_id)
        {
            Some(existing) => {
                *existing = subscription;
                Upsert::Replaced
            }
            None => {
                subs.push(subscription);
                Upsert::Inserted
            }
        }
    }

    /// Remove `subscriber`'s entry on `key`. Empty tables are dropped.
    pub fn remove(&mut self, key: &TableKey, subscriber: &SubscriberId) -> Removal {
        let Some(subs) = self.tables.get_mut(key) else {
            return Removal::NotFound;
        };
        let before = subs.len();
        subs.retain(|s| &s.subscriber_id != subscriber);
        if subs.len() == before {
            return Removal::NotFound;
        }
        let table_empty = subs.is_empty();
        if table_empty {
            self.tables.remove(key);
        }
        Removal::Removed { table_empty }
    }

    /// Sum of subscription-list lengths across all tables.
    pub fn subscriber_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TableKey> {
        self.tables.keys()
    }

    pub fn subscriptions(&self, key: &TableKey) -> &[Subscription] {
        self.tables.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Union of requested events on `key`, or `None` if nobody is
    /// subscribed to it.
    pub fn join_plan(&self, key: &TableKey) -> Option<JoinPlan> {
        let subs = self.tables.get(key)?;
        let events: BTreeSet<EventType> = subs.iter().flat_map(|s| s.events.iter().copied()).collect();
        Some(JoinPlan {
            key: key.clone(),
            events,
        })
    }

    /// One join per table with at least one subscriber.
    pub fn join_plans(&self) -> Vec<JoinPlan> {
        self.tables.keys().filter_map(|key| self.join_plan(key)).collect()
    }

    /// Build the multiplexed callbacks for every (table, event).
    pub fn dispatch_table(&self) -> DispatchTable {
        let mut table = DispatchTable::default();
        for (key, subs) in &self.tables {
            for event in EventType::ALL {
                let routes: Vec<Route> = subs
                    .iter()
                    .filter_map(|s| {
                        s.handler_for(event).map(|callback| Route {
                            subscriber_id: s.subscriber_id.clone(),
                            callback: callback.clone(),
                        })
                    })
                    .collect();
                if !routes.is_empty() {
                    table.insert(key.clone(), event, Multiplexed::new(routes));
                }
            }
        }
        table
    }

    /// Drop everything, returning the tables that were subscribed.
    pub fn clear(&mut self) -> Vec<TableKey> {
        std::mem::take(&mut self.tables).into_keys().collect()
    }
}
