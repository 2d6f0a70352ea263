use std::sync::{Arc, Weak};

/// A trait to take a [Callback] or other custom callback type and
/// produce a [Listener], a weak reference to that callback.
pub trait AsListener<State> {
    /// Produce a [Listener], a weak reference to this callback.
    fn as_listener(&self) -> Listener<State>;
}

/// A weak reference to a callback function (usually [Callback]) which
/// is notified of changes to [Store](crate::Store) `State`.
///
/// When the strong reference associated with it is dropped, invoking the
/// listener surfaces [StoreError::SubscriberDropped](crate::StoreError)
/// from the drain and the stale registry entry is pruned.
#[derive(Clone)]
pub struct Listener<State>(Weak<dyn Fn(Arc<State>) + Send + Sync>);

impl<State> Listener<State> {
    /// Attempt to upgrade the weak reference in this listener to a
    /// [Callback], otherwise if unable to, returns `None`.
    pub fn as_callback(&self) -> Option<Callback<State>> {
        self.0.upgrade().map(Callback)
    }

    pub(crate) fn into_weak(self) -> Weak<dyn Fn(Arc<State>) + Send + Sync> {
        self.0
    }
}

impl<State> AsListener<State> for Listener<State> {
    fn as_listener(&self) -> Listener<State> {
        Listener(self.0.clone())
    }
}

/// A wrapper for a callback which is notified of changes to
/// [Store](crate::Store) `State`.
///
/// Subscribing a `&Callback` via
/// [Store::subscribe_weak()](crate::Store::subscribe_weak) stores only a
/// weak reference: the caller controls the listener's lifetime by holding
/// (or dropping) the `Callback` itself.
#[derive(Clone)]
pub struct Callback<State>(Arc<dyn Fn(Arc<State>) + Send + Sync>);

impl<State> AsListener<State> for &Callback<State> {
    fn as_listener(&self) -> Listener<State> {
        Listener(Arc::downgrade(&self.0))
    }
}

impl<State> Callback<State> {
    pub fn new<C: Fn(Arc<State>) + Send + Sync + 'static>(closure: C) -> Self {
        Callback(Arc::new(closure))
    }

    pub fn emit(&self, state: Arc<State>) {
        (self.0)(state)
    }
}

impl<C, State> From<C> for Callback<State>
where
    C: Fn(Arc<State>) + Send + Sync + 'static,
{
    fn from(closure: C) -> Self {
        Callback(Arc::new(closure))
    }
}

#[cfg(test)]
mod tests {
    use super::{AsListener, Callback};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn listener_upgrades_while_callback_lives() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_copy = count.clone();
        let callback: Callback<u32> = Callback::new(move |state: Arc<u32>| {
            count_copy.fetch_add(*state as usize, Ordering::SeqCst);
        });

        let listener = (&callback).as_listener();
        listener
            .as_callback()
            .expect("callback should still be alive")
            .emit(Arc::new(3));
        assert_eq!(3, count.load(Ordering::SeqCst));
    }

    #[test]
    fn listener_fails_to_upgrade_after_drop() {
        let callback: Callback<u32> = Callback::new(|_| {});
        let listener = (&callback).as_listener();
        drop(callback);
        assert!(listener.as_callback().is_none());
    }
}
