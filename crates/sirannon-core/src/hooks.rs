//! Ordered, snapshot-isolated observer chain.
//!
//! Snapshot isolation: an `invoke`/`invoke_sync` call captures the handler
//! list at entry. Handlers registered during the call do not fire in the
//! current cycle. Handlers disposed during the call still run later in the
//! same cycle if not yet reached in the snapshot.

use crate::error::HookError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeQuery,
    AfterQuery,
    BeforeConnect,
    DatabaseOpen,
    DatabaseClose,
    BeforeSubscribe,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::BeforeQuery => "beforeQuery",
            HookEvent::AfterQuery => "afterQuery",
            HookEvent::BeforeConnect => "beforeConnect",
            HookEvent::DatabaseOpen => "databaseOpen",
            HookEvent::DatabaseClose => "databaseClose",
            HookEvent::BeforeSubscribe => "beforeSubscribe",
        }
    }

    pub const ALL: [HookEvent; 6] = [
        HookEvent::BeforeQuery,
        HookEvent::AfterQuery,
        HookEvent::BeforeConnect,
        HookEvent::DatabaseOpen,
        HookEvent::DatabaseClose,
        HookEvent::BeforeSubscribe,
    ];
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hook handler: given an arbitrary JSON payload, returns a future that
/// resolves to `Ok(())` to allow the operation or `Err` to veto it.
pub type Handler = Arc<dyn Fn(Json) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// An idempotent dispose token: calling [`DisposeToken::dispose`] more than
/// once is a no-op.
pub struct DisposeToken {
    event: HookEvent,
    id: u64,
    registry: Arc<RegistryInner>,
}

impl DisposeToken {
    pub fn dispose(&self) {
        self.registry.remove(self.event, self.id);
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<HookEvent, Vec<(u64, Handler)>>>,
}

impl RegistryInner {
    fn remove(&self, event: HookEvent, id: u64) {
        if let Some(list) = self.handlers.lock().unwrap().get_mut(&event) {
            list.retain(|(hid, _)| *hid != id);
        }
    }

    fn snapshot(&self, event: HookEvent) -> Vec<(u64, Handler)> {
        self.handlers
            .lock()
            .unwrap()
            .get(&event)
            .cloned()
            .unwrap_or_default()
    }
}

/// Ordered handler chain per [`HookEvent`].
#[derive(Clone, Default)]
pub struct HookRegistry {
    inner: Arc<RegistryInner>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event`; fires in registration order.
    /// Double-registering the same function records two independent
    /// entries.
    pub fn register(&self, event: HookEvent, handler: Handler) -> DisposeToken {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .handlers
            .lock()
            .unwrap()
            .entry(event)
            .or_default()
            .push((id, handler));
        DisposeToken {
            event,
            id,
            registry: self.inner.clone(),
        }
    }

    /// Removes all handlers for `event`, or every event if `event` is
    /// `None`.
    pub fn clear(&self, event: Option<HookEvent>) {
        let mut handlers = self.inner.handlers.lock().unwrap();
        match event {
            Some(event) => {
                handlers.remove(&event);
            }
            None => handlers.clear(),
        }
    }

    pub fn handler_count(&self, event: HookEvent) -> usize {
        self.inner.snapshot(event).len()
    }

    /// Captures the handler list at entry and awaits each in turn. An
    /// error from any handler aborts the chain immediately; subsequent
    /// handlers in the snapshot do not run.
    pub async fn invoke(&self, event: HookEvent, payload: Json) -> Result<(), HookError> {
        let snapshot = self.inner.snapshot(event);
        for (_, handler) in snapshot {
            handler(payload.clone())
                .await
                .map_err(|reason| HookError {
                    event: event.as_str(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// A guarded synchronous variant: refuses to run if any handler in the
    /// snapshot does not resolve immediately, raising a programming error
    /// rather than silently dropping the pending handler.
    pub fn invoke_sync(&self, event: HookEvent, payload: Json) -> Result<(), HookError> {
        let snapshot = self.inner.snapshot(event);
        for (_, handler) in snapshot {
            let future = handler(payload.clone());
            match future.now_or_never() {
                Some(Ok(())) => {}
                Some(Err(reason)) => {
                    return Err(HookError {
                        event: event.as_str(),
                        reason,
                    })
                }
                None => {
                    return Err(HookError {
                        event: event.as_str(),
                        reason: "handler did not resolve synchronously; use invoke() instead".to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Initial handler configuration, keyed by event name (`onBeforeQuery`,
/// etc.), consumed once at facade construction.
#[derive(Default)]
pub struct HookConfig {
    pub on_before_query: Vec<Handler>,
    pub on_after_query: Vec<Handler>,
    pub on_before_connect: Vec<Handler>,
    pub on_database_open: Vec<Handler>,
    pub on_database_close: Vec<Handler>,
    pub on_before_subscribe: Vec<Handler>,
}

impl HookRegistry {
    pub fn from_config(config: HookConfig) -> Self {
        let registry = Self::new();
        for h in config.on_before_query {
            registry.register(HookEvent::BeforeQuery, h);
        }
        for h in config.on_after_query {
            registry.register(HookEvent::AfterQuery, h);
        }
        for h in config.on_before_connect {
            registry.register(HookEvent::BeforeConnect, h);
        }
        for h in config.on_database_open {
            registry.register(HookEvent::DatabaseOpen, h);
        }
        for h in config.on_database_close {
            registry.register(HookEvent::DatabaseClose, h);
        }
        for h in config.on_before_subscribe {
            registry.register(HookEvent::BeforeSubscribe, h);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ok_handler(order: Arc<Mutex<Vec<u32>>>, tag: u32) -> Handler {
        Arc::new(move |_payload| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(tag);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn handlers_fire_in_registration_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.register(HookEvent::BeforeQuery, ok_handler(order.clone(), 1));
        registry.register(HookEvent::BeforeQuery, ok_handler(order.clone(), 2));
        registry.register(HookEvent::BeforeQuery, ok_handler(order.clone(), 3));

        registry.invoke(HookEvent::BeforeQuery, Json::Null).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn throwing_handler_aborts_chain() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookEvent::BeforeQuery,
            Arc::new(|_p| async { Err("denied".to_string()) }.boxed()),
        );
        let calls2 = calls.clone();
        registry.register(
            HookEvent::BeforeQuery,
            Arc::new(move |_p| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }.boxed()
            }),
        );

        let err = registry.invoke(HookEvent::BeforeQuery, Json::Null).await.unwrap_err();
        assert_eq!(err.event, "beforeQuery");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registrations_during_cycle_do_not_fire_in_that_cycle() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry2 = registry.clone();
        let order2 = order.clone();

        registry.register(
            HookEvent::BeforeQuery,
            Arc::new(move |_p| {
                let registry3 = registry2.clone();
                let order3 = order2.clone();
                async move {
                    order3.lock().unwrap().push(1);
                    registry3.register(HookEvent::BeforeQuery, ok_handler(order3.clone(), 99));
                    Ok(())
                }
                .boxed()
            }),
        );

        registry.invoke(HookEvent::BeforeQuery, Json::Null).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1]);
        assert_eq!(registry.handler_count(HookEvent::BeforeQuery), 2);

        order.lock().unwrap().clear();
        registry.invoke(HookEvent::BeforeQuery, Json::Null).await.unwrap();
        assert!(order.lock().unwrap().contains(&99));
    }

    #[tokio::test]
    async fn dispose_during_cycle_still_runs_later_handlers_in_same_cycle() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let token_cell: Arc<Mutex<Option<DisposeToken>>> = Arc::new(Mutex::new(None));
        let token_cell2 = token_cell.clone();
        let order1 = order.clone();
        registry.register(
            HookEvent::BeforeQuery,
            Arc::new(move |_p| {
                let token_cell3 = token_cell2.clone();
                let order2 = order1.clone();
                async move {
                    order2.lock().unwrap().push(1);
                    if let Some(token) = token_cell3.lock().unwrap().take() {
                        token.dispose();
                    }
                    Ok(())
                }
                .boxed()
            }),
        );
        let second_token = registry.register(HookEvent::BeforeQuery, ok_handler(order.clone(), 2));
        *token_cell.lock().unwrap() = Some(second_token);

        registry.invoke(HookEvent::BeforeQuery, Json::Null).await.unwrap();
        // Handler 2 was disposed mid-cycle but was already in the snapshot.
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(registry.handler_count(HookEvent::BeforeQuery), 1);
    }

    #[test]
    fn invoke_sync_refuses_pending_handlers() {
        let registry = HookRegistry::new();
        registry.register(
            HookEvent::BeforeQuery,
            Arc::new(|_p| async { tokio::task::yield_now().await; Ok(()) }.boxed()),
        );
        let err = registry.invoke_sync(HookEvent::BeforeQuery, Json::Null);
        assert!(err.is_err());
    }

    #[test]
    fn invoke_sync_runs_immediately_ready_handlers() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.register(HookEvent::BeforeQuery, ok_handler(order.clone(), 1));
        registry.invoke_sync(HookEvent::BeforeQuery, Json::Null).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }

    #[test]
    fn double_registration_creates_two_entries_one_dispose_removes_one() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handler = ok_handler(order.clone(), 1);
        registry.register(HookEvent::BeforeQuery, handler.clone());
        let token2 = registry.register(HookEvent::BeforeQuery, handler);
        assert_eq!(registry.handler_count(HookEvent::BeforeQuery), 2);
        token2.dispose();
        assert_eq!(registry.handler_count(HookEvent::BeforeQuery), 1);
        token2.dispose();
        assert_eq!(registry.handler_count(HookEvent::BeforeQuery), 1);
    }
}
