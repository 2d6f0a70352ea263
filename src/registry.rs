use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

/// How a registry entry holds its callback: strongly (the registry keeps
/// the callback alive) or weakly (the caller does).
pub enum Holder<T: ?Sized> {
    Strong(Arc<T>),
    Weak(Weak<T>),
}

impl<T: ?Sized> Clone for Holder<T> {
    fn clone(&self) -> Self {
        match self {
            Holder::Strong(arc) => Holder::Strong(arc.clone()),
            Holder::Weak(weak) => Holder::Weak(weak.clone()),
        }
    }
}

impl<T: ?Sized> Holder<T> {
    /// A strong reference to the callback, or `None` if it was held
    /// weakly and the referent has been dropped.
    pub fn upgrade(&self) -> Option<Arc<T>> {
        match self {
            Holder::Strong(arc) => Some(arc.clone()),
            Holder::Weak(weak) => weak.upgrade(),
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, Holder::Weak(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubscriptionId(u64);

/// A collection of subscribed callbacks.
///
/// Notification passes iterate over a [snapshot()](Registry::snapshot) of
/// the entries, so the registry tolerates un/subscription (including
/// removal of dropped weak entries) while a pass is in progress; such
/// mutations take effect from the next pass.
pub(crate) struct Registry<T: ?Sized> {
    entries: Mutex<Vec<(SubscriptionId, Holder<T>)>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, holder: Holder<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, holder));
        id
    }

    /// Removes the entry with the given id. Removing an id twice (or an
    /// id that was already pruned) is a no-op.
    pub fn remove(&self, id: SubscriptionId) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    pub fn snapshot(&self) -> Vec<(SubscriptionId, Holder<T>)> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A handle to a registered callback, returned by the store's subscribe
/// operations. [unsubscribe()](Subscription::unsubscribe) is idempotent:
/// the second and subsequent calls are no-ops.
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn unsubscribe(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }
}
