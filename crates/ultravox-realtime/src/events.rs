//! Session events and the publish/subscribe table that delivers them.
//!
//! A [`Session`](crate::Session) reports what happens on its connection through
//! four channels, named by [`EventKind`]. Listeners subscribe per channel and are
//! called in registration order. Subscribing returns a [`Subscription`] that can
//! later remove the listener again.

use crate::{protocol::CallState, session::SessionError};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::warn;

/// The channels a session publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    State,
    Output,
    Error,
    Ended,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::State => "state",
            EventKind::Output => "output",
            EventKind::Error => "error",
            EventKind::Ended => "ended",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The conversation state changed.
    State(CallState),
    /// Agent output accumulated so far in the current turn. `is_final` closes the turn.
    Output { text: String, is_final: bool },
    /// The connection failed. No `Ended` follows.
    Error(Arc<SessionError>),
    /// The remote side closed the connection normally.
    Ended,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::State(_) => EventKind::State,
            SessionEvent::Output { .. } => EventKind::Output,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::Ended => EventKind::Ended,
        }
    }
}

/// Receives session events.
///
/// Any `Fn(&SessionEvent) -> anyhow::Result<()>` closure is a listener. Implement
/// the trait directly for listeners that need to await.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn handle(&self, event: &SessionEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Listener for F
where
    F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &SessionEvent) -> anyhow::Result<()> {
        self(event)
    }
}

struct Entry {
    id: u64,
    kind: EventKind,
    listener: Arc<dyn Listener>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Per-session listener table.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Arc<Mutex<Listeners>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener` to the listeners of `kind`.
    pub fn subscribe<L>(&self, kind: EventKind, listener: L) -> Subscription
    where
        L: Listener + 'static,
    {
        let mut listeners = self.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push(Entry {
            id,
            kind,
            listener: Arc::new(listener),
        });
        Subscription {
            id,
            kind,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Delivers `event` to every listener of its kind, one after another.
    ///
    /// A failing listener is logged and does not stop delivery to the rest.
    pub async fn emit(&self, event: SessionEvent) {
        let kind = event.kind();
        for listener in self.snapshot(kind) {
            if let Err(e) = listener.handle(&event).await {
                warn!(event = %kind, error = ?e, "Event listener failed");
            }
        }
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<dyn Listener>> {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.lock().entries.len())
            .finish()
    }
}

/// Handle for one registered listener.
///
/// Dropping the handle leaves the listener registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes the listener. Returns `false` if the dispatcher is already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(listeners) = self.listeners.upgrade() else {
            return false;
        };
        let mut listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|entry| entry.id != self.id);
        listeners.entries.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    fn recording(
        log: &Log,
        name: &str,
    ) -> impl Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static {
        let log = log.clone();
        let name = name.to_string();
        move |event: &SessionEvent| -> anyhow::Result<()> {
            log.lock().unwrap().push(format!("{}:{}", name, event.kind()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listeners_called_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Log::default();
        let _first = dispatcher.subscribe(EventKind::State, recording(&log, "first"));
        let _second = dispatcher.subscribe(EventKind::State, recording(&log, "second"));
        let _other = dispatcher.subscribe(EventKind::Ended, recording(&log, "other"));

        dispatcher
            .emit(SessionEvent::State(CallState::Listening))
            .await;

        assert_eq!(*log.lock().unwrap(), ["first:state", "second:state"]);
        assert_eq!(dispatcher.listener_count(EventKind::State), 2);
        assert_eq!(dispatcher.listener_count(EventKind::Output), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_listener() {
        let dispatcher = EventDispatcher::new();
        let log = Log::default();
        let first = dispatcher.subscribe(EventKind::Ended, recording(&log, "first"));
        let _second = dispatcher.subscribe(EventKind::Ended, recording(&log, "second"));

        assert_eq!(first.kind(), EventKind::Ended);
        assert!(first.unsubscribe());
        dispatcher.emit(SessionEvent::Ended).await;

        assert_eq!(*log.lock().unwrap(), ["second:ended"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_after_dispatcher_dropped() {
        let dispatcher = EventDispatcher::new();
        let subscription = dispatcher.subscribe(EventKind::Ended, |_: &SessionEvent| -> anyhow::Result<()> { Ok(()) });
        drop(dispatcher);
        assert!(!subscription.unsubscribe());
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_delivery() {
        let dispatcher = EventDispatcher::new();
        let log = Log::default();
        let _failing = dispatcher.subscribe(EventKind::Output, |_: &SessionEvent| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("listener exploded"))
        });
        let _next = dispatcher.subscribe(EventKind::Output, recording(&log, "next"));

        dispatcher
            .emit(SessionEvent::Output {
                text: "Hi".to_string(),
                is_final: true,
            })
            .await;

        assert_eq!(*log.lock().unwrap(), ["next:output"]);
    }

    struct Forward(tokio::sync::mpsc::Sender<String>);

    #[async_trait]
    impl Listener for Forward {
        async fn handle(&self, event: &SessionEvent) -> anyhow::Result<()> {
            if let SessionEvent::Output { text, .. } = event {
                self.0.send(text.clone()).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_async_listener_is_awaited() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let _forward = dispatcher.subscribe(EventKind::Output, Forward(tx));

        dispatcher
            .emit(SessionEvent::Output {
                text: "Hello".to_string(),
                is_final: false,
            })
            .await;

        assert_eq!(rx.recv().await.as_deref(), Some("Hello"));
    }
}
