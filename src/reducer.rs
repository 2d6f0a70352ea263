use std::sync::Arc;

/// A wrapper for a function that implements the [Reducer](Reducer)
/// trait.
///
/// ## Example
///
/// ```
/// # #[derive(Clone)]
/// # struct MyState {
/// #     pub variable: bool
/// # }
/// #
/// # enum MyAction {
/// #     SomeAction
/// # }
/// #
/// # #[derive(Clone)]
/// # enum MyEvent {
/// #     SomeEvent
/// # }
/// use reactive_store::{ReducerFn, ReducerResult, Reducer};
/// use std::sync::Arc;
///
/// let reducer: ReducerFn<MyState, MyAction, MyEvent> = |state, action| {
///     match action {
///         MyAction::SomeAction => {
///             // create a new state to replace the previous one
///             let mut new_state = state.map(|s| MyState::clone(s)).unwrap_or(MyState {
///                 variable: false,
///             });
///             new_state.variable = true;
///             ReducerResult::State(Arc::new(new_state))
///         }
///     }
/// };
///
/// let state1 = Arc::new(MyState {
///     variable: false
/// });
///
/// let result = reducer.reduce(Some(&state1), &MyAction::SomeAction);
/// let state2 = result.state();
///
/// assert_eq!(false, state1.variable);
/// assert_eq!(true, state2.variable);
/// ```
pub type ReducerFn<State, Action, Event> =
    fn(Option<&Arc<State>>, &Action) -> ReducerResult<State, Action, Event>;

impl<State, Action, Event> Reducer<State, Action, Event> for ReducerFn<State, Action, Event> {
    fn reduce(
        &self,
        prev_state: Option<&Arc<State>>,
        action: &Action,
    ) -> ReducerResult<State, Action, Event> {
        (self)(prev_state, action)
    }
}

/// Using the [reduce()](Reducer::reduce()) method, implementors of
/// this trait take an `Action` submitted to a store via
/// [Store::dispatch()](crate::Store::dispatch()) and produce the new
/// `State` for the store, and optionally follow-up actions and events
/// associated with the transition.
///
/// For an example of how a reducer function should work, see
/// [ReducerFn](ReducerFn).
pub trait Reducer<State, Action, Event> {
    /// Take an `Action` submitted to a store via
    /// [Store::dispatch()](crate::Store::dispatch()) and the previous
    /// state (`None` before the store has initialized), and produce the
    /// new `State`.
    ///
    /// This method should be a pure function. Side effects belong in the
    /// `Event`s carried by a [ReducerResult::Composite] result, which the
    /// store routes to its event handlers after the state transition has
    /// been published to the listeners.
    fn reduce(
        &self,
        prev_state: Option<&Arc<State>>,
        action: &Action,
    ) -> ReducerResult<State, Action, Event>;
}

/// The result of a [Reducer::reduce()] function: either a plain state
/// transition, or a transition together with follow-up actions and events.
///
/// Follow-up actions and events are enqueued after the listeners have been
/// notified of the new state, and they bypass the middleware chains since
/// they originate from the reducer rather than from a caller.
pub enum ReducerResult<State, Action, Event> {
    /// A plain state transition.
    State(Arc<State>),
    /// A state transition accompanied by follow-up actions and events.
    Composite {
        state: Arc<State>,
        actions: Vec<Action>,
        events: Vec<Event>,
    },
}

impl<State, Action, Event> ReducerResult<State, Action, Event> {
    /// The new state carried by this result.
    pub fn state(&self) -> &Arc<State> {
        match self {
            ReducerResult::State(state) => state,
            ReducerResult::Composite { state, .. } => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Reducer, ReducerResult};
    use std::sync::Arc;

    struct TestState {
        counter: i32,
    }

    enum TestAction {
        Increment,
        Emit,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Incremented,
    }

    struct TestReducer;

    impl Reducer<TestState, TestAction, TestEvent> for TestReducer {
        fn reduce(
            &self,
            prev_state: Option<&Arc<TestState>>,
            action: &TestAction,
        ) -> ReducerResult<TestState, TestAction, TestEvent> {
            let counter = prev_state.map(|state| state.counter).unwrap_or(0);

            match action {
                TestAction::Increment => ReducerResult::State(Arc::new(TestState {
                    counter: counter + 1,
                })),
                TestAction::Emit => ReducerResult::Composite {
                    state: Arc::new(TestState { counter }),
                    actions: vec![],
                    events: vec![TestEvent::Incremented],
                },
            }
        }
    }

    #[test]
    fn reduce_from_uninitialized() {
        let result = TestReducer.reduce(None, &TestAction::Increment);
        assert_eq!(1, result.state().counter);
    }

    #[test]
    fn composite_result_carries_events() {
        let state = Arc::new(TestState { counter: 3 });
        match TestReducer.reduce(Some(&state), &TestAction::Emit) {
            ReducerResult::Composite { state, events, .. } => {
                assert_eq!(3, state.counter);
                assert_eq!(vec![TestEvent::Incremented], events);
            }
            ReducerResult::State(_) => panic!("expected a composite result"),
        }
    }
}
