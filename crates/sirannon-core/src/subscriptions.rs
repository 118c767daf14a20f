//! Table-indexed, filter-matching fan-out.
//!
//! The polling loop follows a poll/process/catch/continue shape: a broken
//! journal stops the timer, but a single failing callback never does.

use crate::pool::DbPool;
use crate::tracker::{ChangeEvent, ChangeTracker};
use crate::value::Filter;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type SubscriptionId = u64;

/// A callback invoked for every event matching a subscription. Failures are
/// isolated by catching the `Result` the callback itself returns; panics are
/// not caught here, so callbacks should not panic.
pub type Callback = Arc<dyn Fn(&ChangeEvent) -> Result<(), String> + Send + Sync>;

struct Subscription {
    table: String,
    filter: Option<Filter>,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subs: Mutex<HashMap<SubscriptionId, Subscription>>,
    by_table: Mutex<HashMap<String, HashSet<SubscriptionId>>>,
}

/// Owns the subscription registry and table index, and dispatches polled
/// events to matching subscribers.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

fn filter_matches(filter: &Option<Filter>, event: &ChangeEvent) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let Some(effective) = event.effective_row() else {
        return false;
    };
    filter.iter().all(|(key, expected)| {
        effective
            .iter()
            .find(|(col, _)| col == key)
            .map(|(_, actual)| actual == expected)
            .unwrap_or(false)
    })
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription and returns its id. The subscription is
    /// stored *before* any wire acknowledgment is sent by the caller, so a
    /// `change` event emitted between registration and the `subscribed`
    /// ack is still delivered.
    pub fn subscribe(&self, table: impl Into<String>, filter: Option<Filter>, callback: Callback) -> SubscriptionId {
        let table = table.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        self.inner.subs.lock().unwrap().insert(
            id,
            Subscription {
                table: table.clone(),
                filter,
                callback,
            },
        );
        self.inner
            .by_table
            .lock()
            .unwrap()
            .entry(table)
            .or_default()
            .insert(id);

        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self.inner.subs.lock().unwrap().remove(&id);
        if let Some(sub) = removed {
            if let Some(set) = self.inner.by_table.lock().unwrap().get_mut(&sub.table) {
                set.remove(&id);
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().unwrap().len()
    }

    /// Dispatches events in `seq` order; for each, looks up the table's
    /// subscribers and invokes matching callbacks. A failing callback is
    /// isolated and does not block delivery to other subscribers or to
    /// subsequent events.
    pub fn dispatch(&self, events: &[ChangeEvent]) {
        let mut sorted: Vec<&ChangeEvent> = events.iter().collect();
        sorted.sort_by_key(|e| e.seq);

        for event in sorted {
            let subscriber_ids: Vec<SubscriptionId> = {
                let by_table = self.inner.by_table.lock().unwrap();
                match by_table.get(&event.table) {
                    Some(set) => set.iter().copied().collect(),
                    None => continue,
                }
            };

            for id in subscriber_ids {
                let (filter, callback) = {
                    let subs = self.inner.subs.lock().unwrap();
                    match subs.get(&id) {
                        Some(sub) => (sub.filter.clone(), sub.callback.clone()),
                        None => continue,
                    }
                };

                if !filter_matches(&filter, event) {
                    continue;
                }

                if let Err(reason) = callback(event) {
                    warn!(subscription = id, reason, "subscription callback failed, isolated");
                }
            }
        }
    }
}

/// A handle to a running poll loop; dropping it does not stop the loop,
/// call [`PollHandle::cancel`] explicitly. Cancellation is idempotent.
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Spawns a recurring timer that polls `tracker` and dispatches to
/// `manager` every `interval`. An exception in polling stops the timer (the
/// journal is considered broken); exceptions in dispatch do not, since
/// `dispatch` isolates callback failures itself.
pub fn start_polling(
    pool: Arc<DbPool>,
    tracker: Arc<ChangeTracker>,
    manager: SubscriptionManager,
    interval: Duration,
) -> PollHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match tracker.poll(&pool).await {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!(count = events.len(), "dispatching polled CDC events");
                    }
                    manager.dispatch(&events);
                }
                Err(e) => {
                    error!(error = %e, "CDC poll failed, stopping poll loop");
                    break;
                }
            }
        }
    });
    PollHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::atomic::AtomicUsize;

    fn event(table: &str, row: Vec<(String, Value)>, seq: i64) -> ChangeEvent {
        ChangeEvent {
            kind: crate::tracker::ChangeKind::Insert,
            table: table.to_string(),
            row: Some(row),
            old_row: None,
            seq,
            timestamp: 0.0,
        }
    }

    #[test]
    fn filter_matches_on_effective_row_only() {
        let manager = SubscriptionManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let mut filter = Filter::new();
        filter.insert("name".to_string(), Value::Text("Alice".into()));

        manager.subscribe(
            "users",
            Some(filter),
            Arc::new(move |_e| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let alice = event("users", vec![("name".to_string(), Value::Text("Alice".into()))], 1);
        let bob = event("users", vec![("name".to_string(), Value::Text("Bob".into()))], 2);
        manager.dispatch(&[bob, alice]);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_callback_does_not_block_other_subscribers() {
        let manager = SubscriptionManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        manager.subscribe("t", None, Arc::new(|_e| Err("boom".to_string())));
        let hits2 = hits.clone();
        manager.subscribe(
            "t",
            None,
            Arc::new(move |_e| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        manager.dispatch(&[event("t", vec![], 1)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_from_table_index() {
        let manager = SubscriptionManager::new();
        let id = manager.subscribe("t", None, Arc::new(|_e| Ok(())));
        assert_eq!(manager.subscription_count(), 1);
        manager.unsubscribe(id);
        assert_eq!(manager.subscription_count(), 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        manager.subscribe(
            "t",
            None,
            Arc::new(move |_e| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        manager.dispatch(&[event("t", vec![], 1)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
