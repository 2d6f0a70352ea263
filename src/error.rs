use thiserror::Error;

/// Errors surfaced by the fallible [Store](crate::Store) operations.
///
/// Failures inside user callbacks (reducers, middlewares, listeners) are
/// panics and propagate to the caller driving the dispatch; the queues are
/// left intact, so a subsequent [dispatch()](crate::Store::dispatch) or
/// [run()](crate::Store::run) picks up where the aborted drain stopped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The store has not produced a state yet. Returned by
    /// [WithState::call()](crate::WithState::call) unless the wrapper was
    /// configured to ignore an uninitialized store.
    #[error("the store state has not been initialized yet")]
    UninitializedStore,

    /// A weakly held listener was dropped before it could be notified.
    /// The stale entry is pruned when this is detected, so the error is
    /// reported at most once per dropped listener.
    #[error("a weakly held subscriber was dropped before it was notified")]
    SubscriberDropped,
}
