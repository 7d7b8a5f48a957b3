//! Progress events and the progress-specialised event source.

use serde::{Deserialize, Serialize};

use crate::core::event_source::{EventSource, SubscriptionId};
use crate::core::promise::Promise;

/// Kind of a progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Free-form status message.
    Message,
    /// Counters changed; work remains.
    Progress,
    /// Every expected item has completed.
    Completed,
}

/// Aggregate progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Kind of event.
    pub kind: ProgressKind,
    /// Items expected.
    pub total: usize,
    /// Items finished (successfully or not).
    pub completed: usize,
    /// Items that finished with a failure.
    pub failed: usize,
    /// Items currently in flight.
    pub pending: usize,
    /// Message text for `Message` events.
    pub message: Option<String>,
}

impl ProgressEvent {
    /// A status message event.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Message,
            total: 0,
            completed: 0,
            failed: 0,
            pending: 0,
            message: Some(message.into()),
        }
    }

    /// A terminal event; failed counts are reported when unsuccessful.
    #[must_use]
    pub const fn complete(successful: bool) -> Self {
        Self {
            kind: ProgressKind::Completed,
            total: 100,
            completed: 100,
            failed: if successful { 0 } else { 100 },
            pending: 0,
            message: None,
        }
    }

    /// A counters event; `Completed` when `completed == total`.
    #[must_use]
    pub const fn progress(total: usize, completed: usize, failed: usize, pending: usize) -> Self {
        let kind = if total == completed {
            ProgressKind::Completed
        } else {
            ProgressKind::Progress
        };
        Self {
            kind,
            total,
            completed,
            failed,
            pending,
            message: None,
        }
    }

    /// True for `Completed` events.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.kind == ProgressKind::Completed
    }
}

/// Event source carrying [`ProgressEvent`]s.
#[derive(Clone, Default)]
pub struct ProgressEventSource {
    events: EventSource<ProgressEvent>,
}

impl ProgressEventSource {
    /// Create an empty progress source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying event source, for subscription and bridging.
    #[must_use]
    pub const fn events(&self) -> &EventSource<ProgressEvent> {
        &self.events
    }

    /// Publish a progress event.
    pub fn notify(&self, event: ProgressEvent) {
        self.events.notify(event);
    }

    /// Subscribe with replay of the latest snapshot.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.events
            .subscribe(move |_: &EventSource<ProgressEvent>, event: &ProgressEvent| observer(event))
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// The latest snapshot.
    #[must_use]
    pub fn last_event(&self) -> Option<ProgressEvent> {
        self.events.last_event()
    }

    /// True when the latest snapshot has every item completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.last_event()
            .is_some_and(|event| event.completed == event.total)
    }

    /// Resolves at the first `Completed` event with `true` when nothing failed.
    #[must_use]
    pub fn on_complete_promise(&self) -> Promise<bool> {
        self.events.to_promise_when(|event: &ProgressEvent| {
            event.is_completed().then_some(event.failed == 0)
        })
    }
}
