//! Middleware used to rewrite or drop actions and events before they are
//! enqueued during a [Store::dispatch()](crate::Store::dispatch). This
//! module also contains a simple logging middleware which can be used as
//! a utility in an application.

pub mod logger;

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Middleware applied to every action passing through
/// [Store::dispatch()](crate::Store::dispatch), in registration order.
///
/// Each middleware maps the action to its replacement, or to `None` to
/// drop it. A dropped action short-circuits the rest of the chain and is
/// discarded silently: it is never enqueued, never reduced, and no
/// listener is notified for it.
pub trait ActionMiddleware<Action>: Send + Sync {
    fn apply(&self, action: Action) -> Option<Action>;
}

impl<Action, F> ActionMiddleware<Action> for F
where
    F: Fn(Action) -> Option<Action> + Send + Sync,
{
    fn apply(&self, action: Action) -> Option<Action> {
        self(action)
    }
}

/// Middleware applied to every event passing through
/// [Store::dispatch()](crate::Store::dispatch), in registration order.
///
/// The same map-or-drop contract as [ActionMiddleware]: a dropped event is
/// never enqueued and never reaches a handler.
pub trait EventMiddleware<Event>: Send + Sync {
    fn apply(&self, event: Event) -> Option<Event>;
}

impl<Event, F> EventMiddleware<Event> for F
where
    F: Fn(Event) -> Option<Event> + Send + Sync,
{
    fn apply(&self, event: Event) -> Option<Event> {
        self(event)
    }
}

/// Identifies a registered middleware within its chain, for use with the
/// store's `unregister_*_middleware` operations. Ids are only meaningful
/// for the chain which issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiddlewareId(u64);

/// An ordered sequence of middlewares, mutable at runtime. Mutations take
/// effect from the next dispatched item: application walks over a
/// snapshot of the chain.
pub(crate) struct MiddlewareChain<M: ?Sized> {
    entries: Mutex<Vec<(MiddlewareId, Arc<M>)>>,
    next_id: AtomicU64,
}

impl<M: ?Sized> MiddlewareChain<M> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn register(&self, middleware: Arc<M>) -> MiddlewareId {
        let id = MiddlewareId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, middleware));
        id
    }

    /// Returns `true` if the id was present.
    pub fn unregister(&self, id: MiddlewareId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<M>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionMiddleware, MiddlewareChain};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct TestAction(i32);

    #[test]
    fn chain_applies_in_registration_order() {
        let chain: MiddlewareChain<dyn ActionMiddleware<TestAction>> = MiddlewareChain::new();
        chain.register(Arc::new(|action: TestAction| Some(TestAction(action.0 + 1))));
        chain.register(Arc::new(|action: TestAction| Some(TestAction(action.0 * 2))));

        let mut action = TestAction(3);
        for middleware in chain.snapshot() {
            action = middleware.apply(action).expect("nothing drops here");
        }
        assert_eq!(TestAction(8), action);
    }

    #[test]
    fn unregister_is_effective_and_reports_presence() {
        let chain: MiddlewareChain<dyn ActionMiddleware<TestAction>> = MiddlewareChain::new();
        let id = chain.register(Arc::new(|_: TestAction| None));

        assert_eq!(1, chain.snapshot().len());
        assert!(chain.unregister(id));
        assert!(chain.snapshot().is_empty());
        assert!(!chain.unregister(id));
    }
}
