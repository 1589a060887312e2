// In-process event bus with a typed dispatch table.
//
// Event kinds are an enum rather than dotted wildcard strings; any
// number of independent subscribers may register per kind. Delivery is
// at-least-once within the process and best-effort: a handler failure
// is logged and never rolls back the emitting aggregate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

use crate::error::Result;
use crate::models::{MatchDoc, Round, Submission, User};

#[derive(Debug, Clone)]
pub enum Event {
    MatchCreated(Arc<MatchDoc>),
    MatchStatusUpdated(Arc<MatchDoc>),
    MatchRoundsUpdated {
        match_doc: Arc<MatchDoc>,
        round: Round,
    },
    SubmissionCreated(Arc<Submission>),
    SubmissionStatusUpdated(Arc<Submission>),
    /// A submission's cached view of its matches changed.
    SubmissionMatchStatusUpdated(Arc<Submission>),
    UserRatingUpdated(Arc<User>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MatchCreated,
    MatchStatusUpdated,
    MatchRoundsUpdated,
    SubmissionCreated,
    SubmissionStatusUpdated,
    SubmissionMatchStatusUpdated,
    UserRatingUpdated,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MatchCreated(_) => EventKind::MatchCreated,
            Event::MatchStatusUpdated(_) => EventKind::MatchStatusUpdated,
            Event::MatchRoundsUpdated { .. } => EventKind::MatchRoundsUpdated,
            Event::SubmissionCreated(_) => EventKind::SubmissionCreated,
            Event::SubmissionStatusUpdated(_) => EventKind::SubmissionStatusUpdated,
            Event::SubmissionMatchStatusUpdated(_) => EventKind::SubmissionMatchStatusUpdated,
            Event::UserRatingUpdated(_) => EventKind::UserRatingUpdated,
        }
    }
}

pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Subscribe a handler to one event kind. Handlers run in
    /// registration order per emit.
    pub fn on(&self, kind: EventKind, handler: Handler) {
        self.handlers
            .write()
            .expect("event bus lock poisoned")
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Dispatch an event to every subscriber of its kind, awaiting each
    /// in order. Handler errors are logged and swallowed.
    pub async fn emit(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let map = self.handlers.read().expect("event bus lock poisoned");
            match map.get(&event.kind()) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for handler in handlers {
            if let Err(err) = handler(event.clone()).await {
                tracing::error!(kind = ?event.kind(), %err, "event handler failed");
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .expect("event bus lock poisoned")
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LadderState, RatingSummary, Role, User};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_user() -> Arc<User> {
        Arc::new(User {
            id: 7,
            name: "bus".into(),
            role: Role::Student,
            rating: RatingSummary { score: 1500.0, win: 0, lose: 0, draw: 0 },
            ladder: LadderState { streak: 0, change: 0.0, priority: 1.0, initial: true },
        })
    }

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.on(
                EventKind::UserRatingUpdated,
                Arc::new(move |_ev| {
                    let count = count.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }
        bus.emit(Event::UserRatingUpdated(test_user())).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(bus.subscriber_count(EventKind::UserRatingUpdated), 3);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(Event::UserRatingUpdated(test_user())).await;
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(
            EventKind::UserRatingUpdated,
            Arc::new(|_ev| {
                Box::pin(async { Err(crate::error::Error::NotFound("user")) })
            }),
        );
        let count2 = count.clone();
        bus.on(
            EventKind::UserRatingUpdated,
            Arc::new(move |_ev| {
                let count = count2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        bus.emit(Event::UserRatingUpdated(test_user())).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_only_reach_their_kind() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.on(
            EventKind::SubmissionStatusUpdated,
            Arc::new(move |_ev| {
                let count = count2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        bus.emit(Event::UserRatingUpdated(test_user())).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
