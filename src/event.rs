use std::hash::Hash;

/// An `Event` to be produced by a [Store](crate::Store) and routed to the
/// side-effect handlers registered for its [kind](StoreEvent::kind).
///
/// Events are cloned once per registered handler, so the type must be
/// cheap to clone. The [finish()](StoreEvent::finish) variant is reserved:
/// it is enqueued by the store after a finish action has been reduced, and
/// triggers the shutdown sequence instead of being routed to handlers.
pub trait StoreEvent: Clone {
    /// The key which identifies an event variant, used to route an event
    /// to the handlers subscribed for it.
    type Kind: Clone + Eq + Hash + Send + Sync + 'static;

    /// Returns the routing key for this event.
    fn kind(&self) -> Self::Kind;

    /// Produces the event which triggers the shutdown sequence.
    fn finish() -> Self;

    /// Returns `true` if this event triggers the shutdown sequence.
    fn is_finish(&self) -> bool;
}
