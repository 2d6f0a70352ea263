/// An `Action` to be dispatched to a [Store](crate::Store).
///
/// The store reserves two variants of the user's action type for its own
/// lifecycle: [init()](StoreAction::init) is dispatched once when the store
/// is created with the `auto_init` option, and [finish()](StoreAction::finish)
/// requests an orderly shutdown. Both flow through the reducer like any
/// other action.
pub trait StoreAction {
    /// Produces the action dispatched when the store initializes itself.
    fn init() -> Self;

    /// Produces the action which requests an orderly shutdown.
    fn finish() -> Self;

    /// Returns `true` if this action requests an orderly shutdown.
    fn is_finish(&self) -> bool;
}
