use super::{ActionMiddleware, EventMiddleware};
use log::Level;
use std::fmt::Debug;

/// Middleware which publishes every action or event passing through the
/// dispatch pipeline to the [log] facade, without modifying it. Register
/// one instance per chain it should observe.
pub struct LoggerMiddleware {
    level: Level,
}

impl LoggerMiddleware {
    pub fn new() -> Self {
        LoggerMiddleware {
            level: Level::Debug,
        }
    }

    /// Publish at `level` instead of the default [Level::Debug].
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    fn publish(&self, plane: &str, item: &dyn Debug) {
        log::log!(self.level, "{}: {:?}", plane, item);
    }
}

impl Default for LoggerMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl<Action> ActionMiddleware<Action> for LoggerMiddleware
where
    Action: Debug,
{
    fn apply(&self, action: Action) -> Option<Action> {
        self.publish("action", &action);
        Some(action)
    }
}

impl<Event> EventMiddleware<Event> for LoggerMiddleware
where
    Event: Debug,
{
    fn apply(&self, event: Event) -> Option<Event> {
        self.publish("event", &event);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::LoggerMiddleware;
    use crate::middleware::{ActionMiddleware, EventMiddleware};
    use log::Level;

    #[derive(Debug, PartialEq)]
    struct TestAction(i32);

    #[derive(Debug, PartialEq)]
    struct TestEvent(&'static str);

    #[test]
    fn logger_passes_actions_through_unchanged() {
        let middleware = LoggerMiddleware::new();
        assert_eq!(
            Some(TestAction(7)),
            ActionMiddleware::apply(&middleware, TestAction(7))
        );
    }

    #[test]
    fn logger_passes_events_through_unchanged() {
        let middleware = LoggerMiddleware::new().level(Level::Trace);
        assert_eq!(
            Some(TestEvent("ping")),
            EventMiddleware::apply(&middleware, TestEvent("ping"))
        );
    }
}
