use crate::registry::Subscription;
use futures::{future::BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

/// A side-effect handler invoked on a worker thread for every event of
/// the kind it was subscribed for with
/// [Store::subscribe_event()](crate::Store::subscribe_event).
///
/// Plain closures `Fn(E)` implement this trait and run to completion on
/// the worker. A handler with asynchronous work to do returns a future
/// from [handle()](EventHandler::handle); the worker hands it to the task
/// spawner, or drives it on its own event loop when no spawner is
/// configured. See [AsyncHandler] for wrapping an async closure.
pub trait EventHandler<E>: Send + Sync {
    /// Handle the event, optionally returning a future with the
    /// remainder of the work.
    fn handle(&self, event: E) -> Option<BoxFuture<'static, ()>>;
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn handle(&self, event: E) -> Option<BoxFuture<'static, ()>> {
        self(event);
        None
    }
}

/// Adapts an async closure into an [EventHandler].
///
/// ```
/// # use reactive_store::AsyncHandler;
/// let handler = AsyncHandler::new(|event: String| async move {
///     // .. perform the side effect ..
///     drop(event);
/// });
/// ```
pub struct AsyncHandler<F> {
    handler: F,
}

impl<F> AsyncHandler<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<E, F, Fut> EventHandler<E> for AsyncHandler<F>
where
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, event: E) -> Option<BoxFuture<'static, ()>> {
        Some((self.handler)(event).boxed())
    }
}

/// A handle to an event handler registration.
///
/// The record retains a strong reference to the handler: when the handler
/// was subscribed weakly, holding this record is what keeps it alive, and
/// dropping the record lets the registry entry be pruned.
/// [unsubscribe()](EventSubscription::unsubscribe) is idempotent.
pub struct EventSubscription<E> {
    pub(crate) handler: Arc<dyn EventHandler<E>>,
    pub(crate) subscription: Subscription,
}

impl<E> EventSubscription<E> {
    /// The registered handler.
    pub fn handler(&self) -> &Arc<dyn EventHandler<E>> {
        &self.handler
    }

    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::{AsyncHandler, EventHandler};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn sync_closure_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_copy = count.clone();
        let handler = move |event: usize| {
            count_copy.fetch_add(event, Ordering::SeqCst);
        };

        assert!(handler.handle(5).is_none());
        assert_eq!(5, count.load(Ordering::SeqCst));
    }

    #[test]
    fn async_handler_defers_to_a_future() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_copy = count.clone();
        let handler = AsyncHandler::new(move |event: usize| {
            let count = count_copy.clone();
            async move {
                count.fetch_add(event, Ordering::SeqCst);
            }
        });

        let future = handler.handle(7).expect("expected a future");
        assert_eq!(0, count.load(Ordering::SeqCst));
        futures::executor::block_on(future);
        assert_eq!(7, count.load(Ordering::SeqCst));
    }
}
