use crate::{
    action::StoreAction,
    autorun::{Autorun, AutorunBody, AutorunInner, AutorunOptions, BodyAnchor},
    error::StoreError,
    event::StoreEvent,
    handler::{EventHandler, EventSubscription},
    listener::AsListener,
    middleware::{ActionMiddleware, EventMiddleware, MiddlewareChain, MiddlewareId},
    reducer::{Reducer, ReducerResult},
    registry::{Holder, Registry, Subscription},
    worker::{Job, SideEffectWorkerPool, TaskSpawner, TokioWorkerRunner, WorkerRunner},
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// How often the shutdown waiter re-checks for quiescence.
const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An item accepted by [Store::dispatch()]: an action to be reduced, or
/// an event to be routed to the handlers subscribed for its kind.
#[derive(Debug, Clone)]
pub enum DispatchItem<Action, Event> {
    Action(Action),
    Event(Event),
}

/// An external driver for the store's queues.
///
/// When a scheduler is configured, [Store::dispatch()] only enqueues;
/// draining happens whenever the scheduler invokes the repeated callback
/// handed to it at store construction. The auto-init action, if enabled,
/// is handed over as a one-shot callback.
pub trait Scheduler: Send + Sync {
    /// Drive `callback`: repeatedly, at the scheduler's own cadence, when
    /// `repeated` is `true`, or once otherwise.
    fn schedule(&self, callback: Box<dyn Fn() + Send + Sync>, repeated: bool);
}

/// The serializer collaborator behind [Store::snapshot()].
pub trait StateSerializer<State>: Send + Sync {
    fn serialize(&self, state: Option<&State>) -> serde_json::Value;
}

impl<State, F> StateSerializer<State> for F
where
    F: Fn(Option<&State>) -> serde_json::Value + Send + Sync,
{
    fn serialize(&self, state: Option<&State>) -> serde_json::Value {
        self(state)
    }
}

/// A [StateSerializer] for any serde-serializable state. An absent state
/// serializes as `null`.
pub struct JsonSerializer;

impl<State: serde::Serialize> StateSerializer<State> for JsonSerializer {
    fn serialize(&self, state: Option<&State>) -> serde_json::Value {
        match state {
            Some(state) => serde_json::to_value(state).unwrap_or_else(|err| {
                log::warn!("failed to serialize the store state: {}", err);
                serde_json::Value::Null
            }),
            None => serde_json::Value::Null,
        }
    }
}

/// Options for constructing a [Store].
pub struct StoreOptions<State, Action, Event> {
    /// Dispatch [StoreAction::init()] at construction.
    pub auto_init: bool,
    /// Replaces inline draining, see [Scheduler].
    pub scheduler: Option<Arc<dyn Scheduler>>,
    /// Number of side-effect worker threads (at least 1).
    pub side_effect_threads: usize,
    /// Replaces the worker loop, see [WorkerRunner].
    pub side_effect_runner: Option<Arc<dyn WorkerRunner<Event>>>,
    /// Takes over futures produced by event handlers and autorun bodies,
    /// see [TaskSpawner].
    pub task_spawner: Option<Arc<dyn TaskSpawner>>,
    /// How long the queues must remain quiescent after a finish event
    /// before the store cleans itself up.
    pub grace_time: Duration,
    /// Invoked exactly once, after cleanup has completed.
    pub on_finish: Option<Box<dyn FnOnce() + Send>>,
    /// The initial action middleware chain.
    pub action_middlewares: Vec<Arc<dyn ActionMiddleware<Action>>>,
    /// The initial event middleware chain.
    pub event_middlewares: Vec<Arc<dyn EventMiddleware<Event>>>,
    /// The serializer collaborator behind [Store::snapshot()].
    pub serializer: Option<Arc<dyn StateSerializer<State>>>,
}

impl<State, Action, Event> Default for StoreOptions<State, Action, Event> {
    fn default() -> Self {
        Self {
            auto_init: false,
            scheduler: None,
            side_effect_threads: 1,
            side_effect_runner: None,
            task_spawner: None,
            grace_time: Duration::from_secs(1),
            on_finish: None,
            action_middlewares: Vec::new(),
            event_middlewares: Vec::new(),
            serializer: None,
        }
    }
}

pub(crate) struct StoreInner<State, Action, Event: StoreEvent> {
    reducer: Box<dyn Reducer<State, Action, Event> + Send + Sync>,
    /// The current state. `None` until the first action has been reduced.
    state: RwLock<Option<Arc<State>>>,
    /// Guards the drain loop. Never held while user callbacks run on
    /// another thread; acquired with `try_lock` so that a dispatch during
    /// a drain enqueues instead of re-entering.
    drain_lock: Mutex<()>,
    action_queue: Mutex<VecDeque<Action>>,
    event_queue: Mutex<VecDeque<Event>>,
    listeners: Registry<dyn Fn(Arc<State>) + Send + Sync>,
    handlers: Mutex<HashMap<Event::Kind, Registry<dyn EventHandler<Event>>>>,
    action_middlewares: MiddlewareChain<dyn ActionMiddleware<Action>>,
    event_middlewares: MiddlewareChain<dyn EventMiddleware<Event>>,
    pool: SideEffectWorkerPool<Event>,
    spawner: Arc<dyn TaskSpawner>,
    scheduler: Option<Arc<dyn Scheduler>>,
    grace_time: Duration,
    on_finish: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    serializer: Option<Arc<dyn StateSerializer<State>>>,
    finishing: AtomicBool,
    cleaned_up: AtomicBool,
}

impl<State, Action, Event> StoreInner<State, Action, Event>
where
    State: Send + Sync + 'static,
    Action: StoreAction + Send + 'static,
    Event: StoreEvent + Send + 'static,
{
    pub(crate) fn current_state(&self) -> Option<Arc<State>> {
        self.state.read().clone()
    }

    fn enqueue_items(&self, items: impl IntoIterator<Item = DispatchItem<Action, Event>>) {
        for item in items {
            match item {
                DispatchItem::Action(action) => {
                    if let Some(action) = self.apply_action_middlewares(action) {
                        self.action_queue.lock().push_back(action);
                    }
                }
                DispatchItem::Event(event) => {
                    if let Some(event) = self.apply_event_middlewares(event) {
                        self.event_queue.lock().push_back(event);
                    }
                }
            }
        }
    }

    fn apply_action_middlewares(&self, mut action: Action) -> Option<Action> {
        for middleware in self.action_middlewares.snapshot() {
            match middleware.apply(action) {
                Some(replacement) => action = replacement,
                None => {
                    log::trace!("an action was dropped by middleware");
                    return None;
                }
            }
        }
        Some(action)
    }

    fn apply_event_middlewares(&self, mut event: Event) -> Option<Event> {
        for middleware in self.event_middlewares.snapshot() {
            match middleware.apply(event) {
                Some(replacement) => event = replacement,
                None => {
                    log::trace!("an event was dropped by middleware");
                    return None;
                }
            }
        }
        Some(event)
    }

    /// Drain the queues until both are empty. A no-op when a drain is
    /// already in progress: that drain will pick up whatever has been
    /// queued in the meantime.
    pub(crate) fn run(self: &Arc<Self>) -> Result<(), StoreError> {
        let Some(_guard) = self.drain_lock.try_lock() else {
            return Ok(());
        };
        self.drain()
    }

    fn drain(self: &Arc<Self>) -> Result<(), StoreError> {
        loop {
            while let Some(action) = self.pop_action() {
                self.process_action(action)?;
            }
            while let Some(event) = self.pop_event() {
                self.process_event(event);
            }
            // A reducer composite processed in the action pass may have
            // re-filled either queue; keep alternating until quiescent.
            if self.queues_empty() {
                return Ok(());
            }
        }
    }

    fn pop_action(&self) -> Option<Action> {
        self.action_queue.lock().pop_front()
    }

    fn pop_event(&self) -> Option<Event> {
        self.event_queue.lock().pop_front()
    }

    fn queues_empty(&self) -> bool {
        self.action_queue.lock().is_empty() && self.event_queue.lock().is_empty()
    }

    fn process_action(&self, action: Action) -> Result<(), StoreError> {
        let prev_state = self.current_state();
        match self.reducer.reduce(prev_state.as_ref(), &action) {
            ReducerResult::State(state) => self.publish(state)?,
            ReducerResult::Composite {
                state,
                actions,
                events,
            } => {
                self.publish(state)?;
                // Reducer-originated items bypass the middleware chains.
                self.action_queue.lock().extend(actions);
                self.event_queue.lock().extend(events);
            }
        }

        if action.is_finish() {
            self.event_queue.lock().push_back(Event::finish());
        }
        Ok(())
    }

    fn publish(&self, state: Arc<State>) -> Result<(), StoreError> {
        *self.state.write() = Some(state.clone());
        self.notify_listeners(state)
    }

    fn notify_listeners(&self, state: Arc<State>) -> Result<(), StoreError> {
        for (id, holder) in self.listeners.snapshot() {
            match holder.upgrade() {
                Some(listener) => listener(state.clone()),
                None => {
                    // The caller opted into weak holding; surfacing the
                    // dead listener is theirs to observe. The stale entry
                    // is pruned so this is reported once.
                    self.listeners.remove(id);
                    return Err(StoreError::SubscriberDropped);
                }
            }
        }
        Ok(())
    }

    fn process_event(self: &Arc<Self>, event: Event) {
        if event.is_finish() {
            self.begin_shutdown();
            return;
        }

        let kind = event.kind();
        let entries = self
            .handlers
            .lock()
            .get(&kind)
            .map(|registry| registry.snapshot())
            .unwrap_or_default();

        for (id, holder) in entries {
            if holder.is_weak() && holder.upgrade().is_none() {
                if let Some(registry) = self.handlers.lock().get(&kind) {
                    registry.remove(id);
                }
                log::trace!("pruned a dropped event handler");
                continue;
            }
            self.pool.enqueue(Job::Handle(holder, event.clone()));
        }
    }

    /// Spawn the waiter which watches for sustained quiescence and then
    /// performs cleanup. Only the first finish event spawns it.
    fn begin_shutdown(self: &Arc<Self>) {
        if self.finishing.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("store-finalizer".into())
            .spawn(move || {
                loop {
                    if inner.queues_empty() && inner.pool.is_idle() {
                        break;
                    }
                    thread::sleep(QUIESCENCE_POLL_INTERVAL);
                }
                thread::sleep(inner.grace_time);
                inner.clean_up();
            });

        if let Err(err) = spawned {
            log::error!("failed to spawn the shutdown waiter: {}", err);
        }
    }

    /// Join the queued side-effect work, stop and join the workers,
    /// clear the registries and invoke `on_finish`. Subsequent calls are
    /// no-ops.
    pub(crate) fn clean_up(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        self.pool.wait_idle();
        self.pool.stop_and_join();
        self.listeners.clear();
        self.handlers.lock().clear();

        if let Some(on_finish) = self.on_finish.lock().take() {
            on_finish();
        }
    }
}

/// This struct is designed to operate as a central source of truth and
/// global "immutable" state within your application, combined with a
/// side-effect plane: reducers turn dispatched `Action`s into new states
/// (observed by listeners), and dispatched `Event`s are routed to
/// handlers running on a pool of worker threads.
///
/// The handle is cheap to clone; all clones drive the same store.
///
/// The current state ([Store::state()]) can only be modified by
/// dispatching an `Action` via [Store::dispatch()]. Draining happens
/// inline in `dispatch` under a non-reentrant lock (so a dispatch issued
/// from a listener enqueues and returns), unless a [Scheduler] was
/// configured to drive [Store::run()] instead.
///
/// Dispatching [StoreAction::finish()] begins an orderly shutdown: once
/// all queues have been quiescent for the configured grace time, the
/// workers are joined, the registries are cleared and the `on_finish`
/// callback is invoked.
pub struct Store<State, Action, Event: StoreEvent> {
    inner: Arc<StoreInner<State, Action, Event>>,
}

impl<State, Action, Event: StoreEvent> Clone for Store<State, Action, Event> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<State, Action, Event> Store<State, Action, Event>
where
    State: Send + Sync + 'static,
    Action: StoreAction + Send + 'static,
    Event: StoreEvent + Send + 'static,
{
    /// Create a new [Store] which uses the specified `reducer` to handle
    /// `Action`s. The store starts without a state; dispatch
    /// [StoreAction::init()] (or construct with
    /// [auto_init](StoreOptions::auto_init)) to produce the first one.
    pub fn new<R>(reducer: R, options: StoreOptions<State, Action, Event>) -> Self
    where
        R: Reducer<State, Action, Event> + Send + Sync + 'static,
    {
        let StoreOptions {
            auto_init,
            scheduler,
            side_effect_threads,
            side_effect_runner,
            task_spawner,
            grace_time,
            on_finish,
            action_middlewares,
            event_middlewares,
            serializer,
        } = options;

        let runner: Arc<dyn WorkerRunner<Event>> =
            side_effect_runner.unwrap_or_else(|| Arc::new(TokioWorkerRunner));
        let pool = SideEffectWorkerPool::new(side_effect_threads, runner, task_spawner.clone());
        let spawner = task_spawner.unwrap_or_else(|| pool.spawner());

        let action_chain = MiddlewareChain::new();
        for middleware in action_middlewares {
            action_chain.register(middleware);
        }
        let event_chain = MiddlewareChain::new();
        for middleware in event_middlewares {
            event_chain.register(middleware);
        }

        let inner = Arc::new(StoreInner {
            reducer: Box::new(reducer),
            state: RwLock::new(None),
            drain_lock: Mutex::new(()),
            action_queue: Mutex::new(VecDeque::new()),
            event_queue: Mutex::new(VecDeque::new()),
            listeners: Registry::new(),
            handlers: Mutex::new(HashMap::new()),
            action_middlewares: action_chain,
            event_middlewares: event_chain,
            pool,
            spawner,
            scheduler: scheduler.clone(),
            grace_time,
            on_finish: Mutex::new(on_finish),
            serializer,
            finishing: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        });

        inner.pool.start();
        let store = Store { inner };

        if let Some(scheduler) = &scheduler {
            if auto_init {
                let weak = Arc::downgrade(&store.inner);
                scheduler.schedule(
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.enqueue_items([DispatchItem::Action(Action::init())]);
                        }
                    }),
                    false,
                );
            }

            let weak = Arc::downgrade(&store.inner);
            scheduler.schedule(
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        if let Err(err) = inner.run() {
                            log::error!("store drain failed: {}", err);
                        }
                    }
                }),
                true,
            );
        } else if auto_init {
            if let Err(err) = store.dispatch([DispatchItem::Action(Action::init())]) {
                log::error!("auto-init dispatch failed: {}", err);
            }
        }

        store
    }

    /// Get the current `State` stored in this store, or `None` before
    /// the first action has been reduced.
    pub fn state(&self) -> Option<Arc<State>> {
        self.inner.current_state()
    }

    /// Dispatch any number of actions and events. Each item runs through
    /// the matching middleware chain and, unless dropped there, is
    /// enqueued. Without a [Scheduler], the queues are then drained
    /// inline before this returns (unless a drain is already running, in
    /// which case that drain picks the items up).
    pub fn dispatch(
        &self,
        items: impl IntoIterator<Item = DispatchItem<Action, Event>>,
    ) -> Result<(), StoreError> {
        self.inner.enqueue_items(items);
        self.maybe_drain()
    }

    /// Dispatch a single action.
    pub fn dispatch_action(&self, action: Action) -> Result<(), StoreError> {
        self.dispatch([DispatchItem::Action(action)])
    }

    /// Dispatch a single event.
    pub fn dispatch_event(&self, event: Event) -> Result<(), StoreError> {
        self.dispatch([DispatchItem::Event(event)])
    }

    /// Dispatch the items produced by `with_state` from the current
    /// state, followed by the given items; equivalent to two independent
    /// dispatches in sequence. When the store has no state yet,
    /// `with_state` is skipped.
    pub fn dispatch_with<F, I, J>(&self, with_state: F, items: J) -> Result<(), StoreError>
    where
        F: FnOnce(&Arc<State>) -> I,
        I: IntoIterator<Item = DispatchItem<Action, Event>>,
        J: IntoIterator<Item = DispatchItem<Action, Event>>,
    {
        match self.inner.current_state() {
            Some(state) => self.dispatch(with_state(&state))?,
            None => log::trace!("with_state dispatch skipped, the store is uninitialized"),
        }
        self.dispatch(items)
    }

    fn maybe_drain(&self) -> Result<(), StoreError> {
        if self.inner.scheduler.is_some() {
            return Ok(());
        }
        self.inner.run()
    }

    /// Drain the queues until both are empty. Normally invoked through
    /// [Store::dispatch()] or by the configured [Scheduler].
    pub fn run(&self) -> Result<(), StoreError> {
        self.inner.run()
    }

    /// Subscribe a listener to state changes. The listener is held
    /// strongly; use [Store::subscribe_weak()] to tie its lifetime to a
    /// [Callback](crate::Callback) held by the caller.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Arc<State>) + Send + Sync + 'static,
    {
        self.subscribe_holder(Holder::Strong(Arc::new(listener)))
    }

    /// Subscribe a [Listener](crate::Listener) to state changes, holding
    /// it weakly: the store will not keep the callback alive, and a
    /// callback dropped between notifications surfaces
    /// [StoreError::SubscriberDropped] from the drain which detects it.
    pub fn subscribe_weak<L: AsListener<State>>(&self, listener: L) -> Subscription {
        self.subscribe_holder(Holder::Weak(listener.as_listener().into_weak()))
    }

    fn subscribe_holder(&self, holder: Holder<dyn Fn(Arc<State>) + Send + Sync>) -> Subscription {
        let id = self.inner.listeners.insert(holder);
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        })
    }

    /// Subscribe a handler for every event of the given kind. Handlers
    /// run on the side-effect workers; their order relative to other
    /// handlers of the same event is unspecified.
    pub fn subscribe_event<H>(&self, kind: Event::Kind, handler: H) -> EventSubscription<Event>
    where
        H: EventHandler<Event> + 'static,
    {
        let handler: Arc<dyn EventHandler<Event>> = Arc::new(handler);
        self.subscribe_event_holder(kind, Holder::Strong(handler.clone()), handler)
    }

    /// Subscribe a handler weakly: the registry entry lives only as long
    /// as the handler `Arc` has other owners, and the returned record is
    /// one such owner. A weakly held handler found dead at dispatch time
    /// is pruned and its event is not delivered to it.
    pub fn subscribe_event_weak(
        &self,
        kind: Event::Kind,
        handler: Arc<dyn EventHandler<Event>>,
    ) -> EventSubscription<Event> {
        self.subscribe_event_holder(kind, Holder::Weak(Arc::downgrade(&handler)), handler)
    }

    fn subscribe_event_holder(
        &self,
        kind: Event::Kind,
        holder: Holder<dyn EventHandler<Event>>,
        handler: Arc<dyn EventHandler<Event>>,
    ) -> EventSubscription<Event> {
        let id = {
            let mut handlers = self.inner.handlers.lock();
            handlers
                .entry(kind.clone())
                .or_insert_with(Registry::new)
                .insert(holder)
        };

        let weak = Arc::downgrade(&self.inner);
        let subscription = Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(registry) = inner.handlers.lock().get(&kind) {
                    registry.remove(id);
                }
            }
        });

        EventSubscription {
            handler,
            subscription,
        }
    }

    /// Append a middleware to the action chain. Takes effect from the
    /// next dispatched item.
    pub fn register_action_middleware<M>(&self, middleware: M) -> MiddlewareId
    where
        M: ActionMiddleware<Action> + 'static,
    {
        self.inner.action_middlewares.register(Arc::new(middleware))
    }

    /// Remove an action middleware by the id its registration returned.
    /// Returns `false` if it was already unregistered.
    pub fn unregister_action_middleware(&self, id: MiddlewareId) -> bool {
        self.inner.action_middlewares.unregister(id)
    }

    /// Append a middleware to the event chain. Takes effect from the
    /// next dispatched item.
    pub fn register_event_middleware<M>(&self, middleware: M) -> MiddlewareId
    where
        M: EventMiddleware<Event> + 'static,
    {
        self.inner.event_middlewares.register(Arc::new(middleware))
    }

    /// Remove an event middleware by the id its registration returned.
    /// Returns `false` if it was already unregistered.
    pub fn unregister_event_middleware(&self, id: MiddlewareId) -> bool {
        self.inner.event_middlewares.unregister(id)
    }

    /// Serialize the current state with the configured
    /// [StateSerializer], or yield `None` when the store has none
    /// configured. Pure with respect to the store.
    pub fn snapshot(&self) -> Option<serde_json::Value> {
        let serializer = self.inner.serializer.as_ref()?;
        let state = self.inner.current_state();
        Some(serializer.serialize(state.as_deref()))
    }

    /// Block until every queued and in-flight side-effect handler has
    /// finished.
    pub fn wait_for_event_handlers(&self) {
        self.inner.pool.wait_idle();
    }

    /// Immediately perform the shutdown cleanup: join the queued
    /// side-effect work, stop and join the workers, clear the registries
    /// and invoke `on_finish`. Normally reached via the finish action;
    /// calling it twice is a no-op.
    pub fn clean_up(&self) {
        self.inner.clean_up();
    }

    /// Wrap `func` so that each call receives the selector applied to
    /// the store's current state along with the caller's arguments.
    pub fn with_state<Sel, F, T, Args, Ret>(
        &self,
        selector: Sel,
        func: F,
    ) -> WithState<State, T, Args, Ret>
    where
        Sel: Fn(&State) -> T + Send + Sync + 'static,
        F: Fn(T, Args) -> Ret + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        WithState {
            state_getter: Box::new(move || weak.upgrade().and_then(|inner| inner.current_state())),
            selector: Box::new(selector),
            func: Box::new(func),
            ignore_uninitialized: false,
        }
    }

    /// Create an [Autorun] deriving `body(selector(state))`, memoized on
    /// the selected value. With the default options it is reactive: it
    /// subscribes to the store and re-runs on every relevant change.
    pub fn autorun<Sel, Body, T, R>(
        &self,
        selector: Sel,
        body: Body,
        options: AutorunOptions<R>,
    ) -> Autorun<State, T, T, R>
    where
        Sel: Fn(&State) -> Option<T> + Send + Sync + 'static,
        Body: Fn(&T) -> R + Send + Sync + 'static,
        T: Clone + PartialEq + Send + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        self.autorun_with_comparator(selector, |selected: &T| selected.clone(), body, options)
    }

    /// Create an [Autorun] memoized on `comparator(selected)` instead of
    /// the selected value itself.
    pub fn autorun_with_comparator<Sel, Cmp, Body, T, C, R>(
        &self,
        selector: Sel,
        comparator: Cmp,
        body: Body,
        options: AutorunOptions<R>,
    ) -> Autorun<State, T, C, R>
    where
        Sel: Fn(&State) -> Option<T> + Send + Sync + 'static,
        Cmp: Fn(&T) -> C + Send + Sync + 'static,
        Body: Fn(&T) -> R + Send + Sync + 'static,
        T: Clone + Send + 'static,
        C: PartialEq + Send + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        let body: Arc<dyn Fn(&T) -> R + Send + Sync> = Arc::new(body);
        let (holder, anchor) = if options.keep_ref {
            (Holder::Strong(body.clone()), None)
        } else {
            (
                Holder::Weak(Arc::downgrade(&body)),
                Some(BodyAnchor::Sync(body)),
            )
        };
        self.build_autorun(
            Box::new(selector),
            Box::new(comparator),
            AutorunBody::Sync(holder),
            anchor,
            options,
        )
    }

    /// Create an [Autorun] with an asynchronous body. The handling of
    /// the produced future follows [AutorunOptions::auto_await]: cached
    /// as an await-once task, or handed to the task spawner immediately.
    pub fn autorun_async<Sel, Body, Fut, T, R>(
        &self,
        selector: Sel,
        body: Body,
        options: AutorunOptions<R>,
    ) -> Autorun<State, T, T, R>
    where
        Sel: Fn(&State) -> Option<T> + Send + Sync + 'static,
        Body: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        T: Clone + PartialEq + Send + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        let body: Arc<dyn Fn(&T) -> BoxFuture<'static, R> + Send + Sync> =
            Arc::new(move |selected: &T| body(selected).boxed());
        let (holder, anchor) = if options.keep_ref {
            (Holder::Strong(body.clone()), None)
        } else {
            (
                Holder::Weak(Arc::downgrade(&body)),
                Some(BodyAnchor::Async(body)),
            )
        };
        self.build_autorun(
            Box::new(selector),
            Box::new(|selected: &T| selected.clone()),
            AutorunBody::Async(holder),
            anchor,
            options,
        )
    }

    /// Create a view: a purely lazy autorun with no initial call and no
    /// reactivity, refreshed only when [called](Autorun::call).
    pub fn view<Sel, Body, T, R>(&self, selector: Sel, body: Body) -> Autorun<State, T, T, R>
    where
        Sel: Fn(&State) -> Option<T> + Send + Sync + 'static,
        Body: Fn(&T) -> R + Send + Sync + 'static,
        T: Clone + PartialEq + Send + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        self.autorun(selector, body, AutorunOptions::view())
    }

    fn build_autorun<T, C, R>(
        &self,
        selector: Box<dyn Fn(&State) -> Option<T> + Send + Sync>,
        comparator: Box<dyn Fn(&T) -> C + Send + Sync>,
        body: AutorunBody<T, R>,
        anchor: Option<BodyAnchor<T, R>>,
        options: AutorunOptions<R>,
    ) -> Autorun<State, T, C, R>
    where
        T: Clone + Send + 'static,
        C: PartialEq + Send + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        let reactive = options.reactive;
        let initial_call = options.initial_call;

        let weak_store = Arc::downgrade(&self.inner);
        let state_getter =
            Box::new(move || weak_store.upgrade().and_then(|inner| inner.current_state()));

        let inner = Arc::new(AutorunInner::new(
            selector,
            comparator,
            body,
            options,
            state_getter,
            self.inner.spawner.clone(),
        ));

        // The store listener holds the autorun weakly so that a
        // short-lived autorun does not leak through its subscription;
        // dropping the handle also unsubscribes.
        let store_subscription = if reactive {
            let weak = Arc::downgrade(&inner);
            Some(self.subscribe(move |state: Arc<State>| {
                if let Some(autorun) = weak.upgrade() {
                    autorun.on_state(&state);
                }
            }))
        } else {
            None
        };

        if initial_call {
            if let Some(state) = self.state() {
                inner.check(Some(&state));
                inner.evaluate(false);
            }
        }

        Autorun::from_parts(inner, store_subscription, anchor)
    }
}

/// Wraps a selector and a function: each [call()](WithState::call)
/// applies the selector to the store's current state and forwards the
/// selected value, together with the caller's arguments, to the function.
///
/// Created by [Store::with_state()].
pub struct WithState<State, T, Args, Ret> {
    state_getter: Box<dyn Fn() -> Option<Arc<State>> + Send + Sync>,
    selector: Box<dyn Fn(&State) -> T + Send + Sync>,
    func: Box<dyn Fn(T, Args) -> Ret + Send + Sync>,
    ignore_uninitialized: bool,
}

impl<State, T, Args, Ret> WithState<State, T, Args, Ret> {
    /// Yield `Ok(None)` instead of
    /// [StoreError::UninitializedStore] when the store has no state.
    pub fn ignoring_uninitialized(mut self) -> Self {
        self.ignore_uninitialized = true;
        self
    }

    pub fn call(&self, args: Args) -> Result<Option<Ret>, StoreError> {
        match (self.state_getter)() {
            Some(state) => {
                let selected = (self.selector)(&state);
                Ok(Some((self.func)(selected, args)))
            }
            None if self.ignore_uninitialized => Ok(None),
            None => Err(StoreError::UninitializedStore),
        }
    }
}
