use crate::registry::{Holder, Registry, Subscription};
use crate::worker::TaskSpawner;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Options controlling an [Autorun], recognized by
/// [Store::autorun()](crate::Store::autorun) and related constructors.
pub struct AutorunOptions<R> {
    /// Value yielded before the first successful body evaluation.
    pub default_value: Option<R>,
    /// Run the body once on creation when the store already has a state.
    pub initial_call: bool,
    /// Subscribe to store state changes and invoke the body on change.
    pub reactive: bool,
    /// Hand the future produced by an async body to the task spawner
    /// immediately instead of caching it as an awaitable task.
    pub auto_await: bool,
    /// When disabled, every call re-runs the body.
    pub memoization: bool,
    /// Hold the body strongly. With `false` the body lives only as long
    /// as the [Autorun] handle.
    pub keep_ref: bool,
    /// Default for `initial_run` in [Autorun::subscribe()].
    pub subscribers_initial_run: bool,
    /// Default holding for subscribers registered via
    /// [Autorun::subscribe()].
    pub subscribers_keep_ref: bool,
}

impl<R> Default for AutorunOptions<R> {
    fn default() -> Self {
        Self {
            default_value: None,
            initial_call: true,
            reactive: true,
            auto_await: true,
            memoization: true,
            keep_ref: true,
            subscribers_initial_run: false,
            subscribers_keep_ref: true,
        }
    }
}

impl<R> AutorunOptions<R> {
    /// The options of a view: purely lazy, change-detected memoization
    /// with no initial call, no reactivity, and awaitable task results.
    pub fn view() -> Self {
        Self {
            initial_call: false,
            reactive: false,
            auto_await: false,
            ..Self::default()
        }
    }
}

/// The value yielded by invoking an [Autorun].
#[derive(Clone)]
pub enum AutorunValue<R> {
    /// No successful body evaluation has happened yet, and no default
    /// value was configured.
    Uninitialized,
    /// The result of the latest body run.
    Value(R),
    /// The in-flight result of an async body run. Awaiting the task (or
    /// any clone of it) yields the single underlying result; a task
    /// replaced before ever being awaited is dropped, cancelling it.
    Task(Shared<BoxFuture<'static, R>>),
    /// An async body run whose future was handed to the task spawner.
    Scheduled,
}

impl<R> AutorunValue<R> {
    /// The settled value, if there is one.
    pub fn as_value(&self) -> Option<&R> {
        match self {
            AutorunValue::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The awaitable task, if the latest run produced one.
    pub fn as_task(&self) -> Option<&Shared<BoxFuture<'static, R>>> {
        match self {
            AutorunValue::Task(task) => Some(task),
            _ => None,
        }
    }

    /// Whether subscribers should be told about a transition from `self`
    /// to `other`. Every fresh task or scheduled run counts as a change.
    fn same_as(&self, other: &Self) -> bool
    where
        R: PartialEq,
    {
        match (self, other) {
            (AutorunValue::Uninitialized, AutorunValue::Uninitialized) => true,
            (AutorunValue::Value(a), AutorunValue::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl<R: Debug> Debug for AutorunValue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutorunValue::Uninitialized => write!(f, "Uninitialized"),
            AutorunValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            AutorunValue::Task(_) => write!(f, "Task(..)"),
            AutorunValue::Scheduled => write!(f, "Scheduled"),
        }
    }
}

/// The body of an [Autorun]: synchronous, or asynchronous with the future
/// handling dictated by [AutorunOptions::auto_await].
pub(crate) enum AutorunBody<T, R> {
    Sync(Holder<dyn Fn(&T) -> R + Send + Sync>),
    Async(Holder<dyn Fn(&T) -> BoxFuture<'static, R> + Send + Sync>),
}

/// Strong anchor for a weakly held body, owned by the [Autorun] handle.
pub(crate) enum BodyAnchor<T, R> {
    Sync(#[allow(dead_code)] Arc<dyn Fn(&T) -> R + Send + Sync>),
    Async(#[allow(dead_code)] Arc<dyn Fn(&T) -> BoxFuture<'static, R> + Send + Sync>),
}

struct AutorunCell<T, C, R> {
    last_selected: Option<T>,
    last_comparator_value: Option<C>,
    should_run: bool,
    cached: AutorunValue<R>,
}

impl<T, C, R> Default for AutorunCell<T, C, R> {
    fn default() -> Self {
        Self {
            last_selected: None,
            last_comparator_value: None,
            should_run: false,
            cached: AutorunValue::Uninitialized,
        }
    }
}

pub(crate) struct AutorunInner<S, T, C, R> {
    pub(crate) selector: Box<dyn Fn(&S) -> Option<T> + Send + Sync>,
    pub(crate) comparator: Box<dyn Fn(&T) -> C + Send + Sync>,
    pub(crate) body: AutorunBody<T, R>,
    pub(crate) options: AutorunOptions<R>,
    pub(crate) state_getter: Box<dyn Fn() -> Option<Arc<S>> + Send + Sync>,
    pub(crate) spawner: Arc<dyn TaskSpawner>,
    pub(crate) cell: Mutex<AutorunCell<T, C, R>>,
    pub(crate) subscribers: Registry<dyn Fn(&AutorunValue<R>) + Send + Sync>,
}

impl<S, T, C, R> AutorunInner<S, T, C, R> {
    pub(crate) fn new(
        selector: Box<dyn Fn(&S) -> Option<T> + Send + Sync>,
        comparator: Box<dyn Fn(&T) -> C + Send + Sync>,
        body: AutorunBody<T, R>,
        options: AutorunOptions<R>,
        state_getter: Box<dyn Fn() -> Option<Arc<S>> + Send + Sync>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            selector,
            comparator,
            body,
            options,
            state_getter,
            spawner,
            cell: Mutex::new(AutorunCell::default()),
            subscribers: Registry::new(),
        }
    }
}

impl<S, T, C, R> AutorunInner<S, T, C, R>
where
    T: Clone + Send + 'static,
    C: PartialEq + Send + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    /// Record whether the body needs to run for the given state. The
    /// remembered selector and comparator values are updated regardless
    /// of the outcome.
    pub(crate) fn check(&self, state: Option<&Arc<S>>) {
        let mut cell = self.cell.lock();

        let Some(state) = state else {
            // Nothing to project yet.
            cell.should_run = false;
            return;
        };

        // A selector which cannot produce its projection yet defers the
        // decision to a later state.
        let Some(selected) = (self.selector)(state) else {
            return;
        };

        let comparator_value = (self.comparator)(&selected);
        if cell.last_comparator_value.as_ref() != Some(&comparator_value) {
            cell.should_run = true;
        }

        cell.last_selected = Some(selected);
        cell.last_comparator_value = Some(comparator_value);
    }

    /// Re-check against the store's current state.
    pub(crate) fn refresh(&self) {
        let state = (self.state_getter)();
        self.check(state.as_ref());
    }

    /// State-listener entry point for the reactive variant.
    pub(crate) fn on_state(&self, state: &Arc<S>) {
        self.check(Some(state));
        let run = {
            let cell = self.cell.lock();
            cell.should_run || !self.options.memoization
        };
        if run {
            self.evaluate(false);
        }
    }

    /// Run the body if it is due (or forced), cache the produced value,
    /// and notify subscribers of a change. Yields the cached value.
    pub(crate) fn evaluate(&self, force: bool) -> AutorunValue<R> {
        let (selected, prior) = {
            let mut cell = self.cell.lock();
            let run = force || cell.should_run || !self.options.memoization;
            if !run {
                return self.current_value(&cell);
            }

            let Some(selected) = cell.last_selected.clone() else {
                // Nothing has ever been selected; there is no input to
                // run the body with.
                return self.current_value(&cell);
            };

            cell.should_run = false;
            (selected, cell.cached.clone())
        };

        // The body runs without the cell lock held so that it may call
        // back into this autorun (or dispatch to the store) freely.
        let produced = self.run_body(&selected);

        let (value, changed) = {
            let mut cell = self.cell.lock();
            match produced {
                Some(new) => {
                    let changed = !new.same_as(&prior);
                    cell.cached = new.clone();
                    (new, changed)
                }
                None => {
                    log::trace!("autorun body was dropped, keeping the cached value");
                    (self.current_value(&cell), false)
                }
            }
        };

        if changed {
            self.notify_subscribers(&value);
        }
        value
    }

    fn run_body(&self, selected: &T) -> Option<AutorunValue<R>> {
        match &self.body {
            AutorunBody::Sync(holder) => holder
                .upgrade()
                .map(|body| AutorunValue::Value(body(selected))),
            AutorunBody::Async(holder) => holder.upgrade().map(|body| {
                let future = body(selected);
                if self.options.auto_await {
                    self.spawner.spawn(future.map(|_| ()).boxed());
                    AutorunValue::Scheduled
                } else {
                    // Replacing the cached task drops the previous one;
                    // if it was never awaited, that cancels it.
                    AutorunValue::Task(future.shared())
                }
            }),
        }
    }

    pub(crate) fn current_value(&self, cell: &AutorunCell<T, C, R>) -> AutorunValue<R> {
        match &cell.cached {
            AutorunValue::Uninitialized => match &self.options.default_value {
                Some(default) => AutorunValue::Value(default.clone()),
                None => AutorunValue::Uninitialized,
            },
            cached => cached.clone(),
        }
    }

    fn notify_subscribers(&self, value: &AutorunValue<R>) {
        for (id, holder) in self.subscribers.snapshot() {
            match holder.upgrade() {
                Some(subscriber) => subscriber(value),
                None => self.subscribers.remove(id),
            }
        }
    }
}

/// A derivation over the store state: `body(selector(state))`, memoized
/// on a comparator over the selected value and refreshed lazily (via
/// [call()](Autorun::call)) or reactively (on every relevant state
/// change, when created with `reactive`).
///
/// Dropping the handle detaches a reactive autorun from the store.
pub struct Autorun<S, T, C, R> {
    inner: Arc<AutorunInner<S, T, C, R>>,
    store_subscription: Option<Subscription>,
    _body_anchor: Option<BodyAnchor<T, R>>,
}

impl<S, T, C, R> Autorun<S, T, C, R>
where
    S: 'static,
    T: Clone + Send + 'static,
    C: PartialEq + Send + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn from_parts(
        inner: Arc<AutorunInner<S, T, C, R>>,
        store_subscription: Option<Subscription>,
        body_anchor: Option<BodyAnchor<T, R>>,
    ) -> Self {
        Self {
            inner,
            store_subscription,
            _body_anchor: body_anchor,
        }
    }

    /// Check the current state and run the body if its projected input
    /// changed since the last run (or on every call, with memoization
    /// disabled). Yields the cached value.
    pub fn call(&self) -> AutorunValue<R> {
        self.inner.refresh();
        self.inner.evaluate(false)
    }

    /// Run the body unconditionally with the most recently selected
    /// input, bypassing memoization for this one call.
    pub fn force(&self) -> AutorunValue<R> {
        self.inner.refresh();
        self.inner.evaluate(true)
    }

    /// The cached value, without checking the state or running the body.
    pub fn value(&self) -> AutorunValue<R> {
        let cell = self.inner.cell.lock();
        self.inner.current_value(&cell)
    }

    /// Subscribe to changes of this autorun's cached value, with the
    /// `subscribers_initial_run` and `subscribers_keep_ref` defaults from
    /// the autorun's options.
    pub fn subscribe<F>(&self, subscriber: F) -> AutorunSubscription<R>
    where
        F: Fn(&AutorunValue<R>) + Send + Sync + 'static,
    {
        self.subscribe_with(
            subscriber,
            self.inner.options.subscribers_initial_run,
            self.inner.options.subscribers_keep_ref,
        )
    }

    /// Subscribe to changes of this autorun's cached value.
    ///
    /// With `initial_run` the subscriber is additionally called once
    /// immediately, with the current value. With `keep_ref = false` the
    /// subscriber is held weakly: the returned record anchors it, so
    /// dropping the record retires the subscriber.
    pub fn subscribe_with<F>(
        &self,
        subscriber: F,
        initial_run: bool,
        keep_ref: bool,
    ) -> AutorunSubscription<R>
    where
        F: Fn(&AutorunValue<R>) + Send + Sync + 'static,
    {
        let subscriber: Arc<dyn Fn(&AutorunValue<R>) + Send + Sync> = Arc::new(subscriber);
        let holder = if keep_ref {
            Holder::Strong(subscriber.clone())
        } else {
            Holder::Weak(Arc::downgrade(&subscriber))
        };
        let id = self.inner.subscribers.insert(holder);

        if initial_run {
            let value = self.value();
            subscriber(&value);
        }

        let weak = Arc::downgrade(&self.inner);
        AutorunSubscription {
            subscription: Subscription::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.remove(id);
                }
            }),
            _anchor: if keep_ref { None } else { Some(subscriber) },
        }
    }
}

impl<S, T, C, R> Drop for Autorun<S, T, C, R> {
    fn drop(&mut self) {
        if let Some(subscription) = self.store_subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// A handle to an autorun subscriber registration. Holds the subscriber
/// alive when it was registered with `keep_ref = false`.
/// [unsubscribe()](AutorunSubscription::unsubscribe) is idempotent.
pub struct AutorunSubscription<R> {
    subscription: Subscription,
    _anchor: Option<Arc<dyn Fn(&AutorunValue<R>) + Send + Sync>>,
}

impl<R> AutorunSubscription<R> {
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::{Autorun, AutorunBody, AutorunInner, AutorunOptions, AutorunValue};
    use crate::registry::Holder;
    use crate::worker::TaskSpawner;
    use futures::{future::BoxFuture, FutureExt};
    use parking_lot::RwLock;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Debug)]
    struct TestState {
        count: i64,
        name: Option<String>,
    }

    struct ImmediateSpawner;

    impl TaskSpawner for ImmediateSpawner {
        fn spawn(&self, task: BoxFuture<'static, ()>) {
            futures::executor::block_on(task);
        }
    }

    type SharedState = Arc<RwLock<Option<Arc<TestState>>>>;

    fn state_slot(count: i64) -> SharedState {
        Arc::new(RwLock::new(Some(Arc::new(TestState {
            count,
            name: None,
        }))))
    }

    fn count_selector() -> Box<dyn Fn(&TestState) -> Option<i64> + Send + Sync> {
        Box::new(|state: &TestState| Some(state.count))
    }

    fn counting_autorun(
        slot: &SharedState,
        options: AutorunOptions<i64>,
    ) -> (Autorun<TestState, i64, i64, i64>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_copy = runs.clone();
        let body: Arc<dyn Fn(&i64) -> i64 + Send + Sync> = Arc::new(move |count: &i64| {
            runs_copy.fetch_add(1, Ordering::SeqCst);
            count * 10
        });

        let slot_copy = slot.clone();
        let inner = Arc::new(AutorunInner::new(
            count_selector(),
            Box::new(|selected: &i64| *selected),
            AutorunBody::Sync(Holder::Strong(body)),
            options,
            Box::new(move || slot_copy.read().clone()),
            Arc::new(ImmediateSpawner),
        ));

        (Autorun::from_parts(inner, None, None), runs)
    }

    fn set_count(slot: &SharedState, count: i64) {
        *slot.write() = Some(Arc::new(TestState { count, name: None }));
    }

    #[test]
    fn memoized_body_runs_only_on_comparator_change() {
        let slot = state_slot(1);
        let (autorun, runs) = counting_autorun(&slot, AutorunOptions::view());

        assert_eq!(Some(&10), autorun.call().as_value());
        assert_eq!(1, runs.load(Ordering::SeqCst));

        // Same projected value, no new run.
        set_count(&slot, 1);
        assert_eq!(Some(&10), autorun.call().as_value());
        assert_eq!(1, runs.load(Ordering::SeqCst));

        set_count(&slot, 2);
        assert_eq!(Some(&20), autorun.call().as_value());
        assert_eq!(2, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn disabled_memoization_reruns_every_call() {
        let slot = state_slot(1);
        let (autorun, runs) = counting_autorun(
            &slot,
            AutorunOptions {
                memoization: false,
                ..AutorunOptions::view()
            },
        );

        autorun.call();
        autorun.call();
        assert_eq!(2, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn force_bypasses_memoization_once() {
        let slot = state_slot(1);
        let (autorun, runs) = counting_autorun(&slot, AutorunOptions::view());

        autorun.call();
        autorun.call();
        assert_eq!(1, runs.load(Ordering::SeqCst));

        autorun.force();
        assert_eq!(2, runs.load(Ordering::SeqCst));

        autorun.call();
        assert_eq!(2, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn default_value_is_yielded_before_the_first_run() {
        let slot: SharedState = Arc::new(RwLock::new(None));
        let (autorun, runs) = counting_autorun(
            &slot,
            AutorunOptions {
                default_value: Some(-1),
                ..AutorunOptions::view()
            },
        );

        assert_eq!(Some(&-1), autorun.call().as_value());
        assert_eq!(0, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn deferring_selector_leaves_the_cached_value() {
        let slot = state_slot(0);

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_copy = runs.clone();
        let body: Arc<dyn Fn(&String) -> String + Send + Sync> =
            Arc::new(move |name: &String| {
                runs_copy.fetch_add(1, Ordering::SeqCst);
                name.to_uppercase()
            });

        let slot_copy = slot.clone();
        let inner = Arc::new(AutorunInner::new(
            Box::new(|state: &TestState| state.name.clone()),
            Box::new(|selected: &String| selected.clone()),
            AutorunBody::Sync(Holder::Strong(body)),
            AutorunOptions::view(),
            Box::new(move || slot_copy.read().clone()),
            Arc::new(ImmediateSpawner),
        ));
        let autorun: Autorun<TestState, String, String, String> =
            Autorun::from_parts(inner, None, None);

        // The projection is not available yet.
        assert!(autorun.call().as_value().is_none());
        assert_eq!(0, runs.load(Ordering::SeqCst));

        *slot.write() = Some(Arc::new(TestState {
            count: 0,
            name: Some("ada".into()),
        }));
        assert_eq!(Some(&"ADA".to_string()), autorun.call().as_value());
        assert_eq!(1, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn subscribers_hear_changes_and_initial_run() {
        let slot = state_slot(1);
        let (autorun, _runs) = counting_autorun(&slot, AutorunOptions::view());
        autorun.call();

        let heard = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        let heard_copy = heard.clone();
        let last_copy = last.clone();
        let subscription = autorun.subscribe_with(
            move |value: &AutorunValue<i64>| {
                heard_copy.fetch_add(1, Ordering::SeqCst);
                if let Some(value) = value.as_value() {
                    last_copy.store(*value as usize, Ordering::SeqCst);
                }
            },
            true,
            true,
        );

        // Initial run with the current value.
        assert_eq!(1, heard.load(Ordering::SeqCst));
        assert_eq!(10, last.load(Ordering::SeqCst));

        set_count(&slot, 2);
        autorun.call();
        assert_eq!(2, heard.load(Ordering::SeqCst));
        assert_eq!(20, last.load(Ordering::SeqCst));

        // An unchanged result is not a notification.
        autorun.call();
        assert_eq!(2, heard.load(Ordering::SeqCst));

        subscription.unsubscribe();
        set_count(&slot, 3);
        autorun.call();
        assert_eq!(2, heard.load(Ordering::SeqCst));
    }

    fn async_autorun(
        slot: &SharedState,
        options: AutorunOptions<i64>,
        runs: Arc<AtomicUsize>,
    ) -> Autorun<TestState, i64, i64, i64> {
        let body: Arc<dyn Fn(&i64) -> BoxFuture<'static, i64> + Send + Sync> =
            Arc::new(move |count: &i64| {
                let count = *count;
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    count * 10
                }
                .boxed()
            });

        let slot_copy = slot.clone();
        let inner = Arc::new(AutorunInner::new(
            count_selector(),
            Box::new(|selected: &i64| *selected),
            AutorunBody::Async(Holder::Strong(body)),
            options,
            Box::new(move || slot_copy.read().clone()),
            Arc::new(ImmediateSpawner),
        ));
        Autorun::from_parts(inner, None, None)
    }

    #[test]
    fn awaitable_task_yields_its_result_once_for_all_awaiters() {
        let slot = state_slot(3);
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = async_autorun(&slot, AutorunOptions::view(), runs.clone());

        let task = autorun
            .call()
            .as_task()
            .expect("expected an awaitable task")
            .clone();

        let first = futures::executor::block_on(task.clone());
        let second = futures::executor::block_on(task);
        assert_eq!(30, first);
        assert_eq!(30, second);
        // The underlying future ran once.
        assert_eq!(1, runs.load(Ordering::SeqCst));
    }

    #[test]
    fn auto_await_schedules_the_future_immediately() {
        let slot = state_slot(3);
        let runs = Arc::new(AtomicUsize::new(0));
        let autorun = async_autorun(
            &slot,
            AutorunOptions {
                auto_await: true,
                ..AutorunOptions::view()
            },
            runs.clone(),
        );

        let value = autorun.call();
        assert!(matches!(value, AutorunValue::Scheduled));
        // The immediate spawner drove the future to completion inline.
        assert_eq!(1, runs.load(Ordering::SeqCst));
    }
}
