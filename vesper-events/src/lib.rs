//! VESPER Events - Post-Commit Change Fan-Out
//!
//! Storage engines report every successful atomic write to their commit
//! observers. [`ChangeNotifier`] is the observer factory the tenant registry
//! attaches to each engine; it re-publishes the records, tagged with their
//! tenant, to any number of filtered subscribers without ever blocking the
//! committing caller.

mod notifier;

pub use notifier::{
    ChangeBatch, ChangeNotifier, NotifierSnapshot, Subscription, SubscriptionFilter,
};
