//! In-process event bus
//!
//! Publishers hand normalized [`SessionEvent`]s to a bounded queue and return
//! immediately. One consumer task drains the queue and fans each event out to
//! the handlers subscribed to its type (or to `*`).
//!
//! ```text
//! publish() ──► [ bounded queue ] ──► consumer ──┬──► handler task
//!   (drops oldest when full)                     ├──► handler task
//!                                                └──► handler task
//! ```
//!
//! The store is written by the publisher before publishing, so losing an
//! event here only affects live observers.

use crate::error::Result;
use crate::types::{AgentType, EventType, SessionEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Subscription key matching every event type
pub const WILDCARD: &str = "*";

/// Async event handler
pub type Handler = Arc<dyn Fn(SessionEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    key: String,
    handler: Handler,
}

struct Queue {
    events: VecDeque<SessionEvent>,
    closed: bool,
}

struct BusInner {
    capacity: usize,
    queue: Mutex<Queue>,
    wakeup: Notify,
    subscribers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
}

/// Bounded publish/subscribe bus with drop-oldest backpressure
pub struct EventBus {
    inner: Arc<BusInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                queue: Mutex::new(Queue {
                    events: VecDeque::new(),
                    closed: false,
                }),
                wakeup: Notify::new(),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
            }),
            consumer: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the consumer task. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run().await });
        *self.consumer.lock().unwrap() = Some(handle);
        tracing::debug!(capacity = self.inner.capacity, "Event bus started");
    }

    /// Register a handler for one event type wire name, or [`WILDCARD`]
    pub fn subscribe_handler(&self, key: &str, handler: Handler) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().unwrap().push(Subscription {
            id,
            key: key.to_string(),
            handler,
        });
        id
    }

    /// Register an async closure as a handler
    pub fn subscribe<F, Fut>(&self, key: &str, f: F) -> SubscriptionId
    where
        F: Fn(SessionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| f(event).boxed());
        self.subscribe_handler(key, handler)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write().unwrap();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Enqueue an event without waiting.
    ///
    /// When the queue is full the oldest queued event is discarded. Returns
    /// false once the bus has been shut down.
    pub fn publish(&self, event: SessionEvent) -> bool {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.closed {
                return false;
            }
            if queue.events.len() >= self.inner.capacity {
                if let Some(old) = queue.events.pop_front() {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(event_id = %old.id, "Event queue full, dropped oldest");
                }
            }
            queue.events.push_back(event);
        }
        self.inner.wakeup.notify_one();
        true
    }

    /// Stop accepting events, dispatch everything still queued, then stop
    /// the consumer
    pub async fn shutdown(&self) {
        self.inner.queue.lock().unwrap().closed = true;
        self.inner.wakeup.notify_one();

        let handle = self.consumer.lock().unwrap().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Event bus consumer failed");
                }
            }
            // Never started: flush inline
            None => Arc::clone(&self.inner).run().await,
        }
        tracing::debug!(
            dispatched = self.dispatched_count(),
            dropped = self.dropped_count(),
            "Event bus stopped"
        );
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().unwrap().events.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Events taken off the queue and handed to subscribers
    pub fn dispatched_count(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.lock().unwrap().closed
    }
}

impl BusInner {
    async fn run(self: Arc<Self>) {
        loop {
            let (next, closed) = {
                let mut queue = self.queue.lock().unwrap();
                (queue.events.pop_front(), queue.closed)
            };
            match next {
                Some(event) => self.dispatch(event).await,
                None if closed => break,
                None => self.wakeup.notified().await,
            }
        }
    }

    async fn dispatch(&self, event: SessionEvent) {
        let key = event.event_type.as_str();
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.key == WILDCARD || s.key == key)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if handlers.is_empty() {
            return;
        }

        // Each handler in its own task so a panic stays contained
        let tasks: Vec<JoinHandle<Result<()>>> = handlers
            .into_iter()
            .map(|handler| tokio::spawn(handler(event.clone())))
            .collect();

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event_type = key, event_id = %event.id, error = %e, "Event handler failed");
                }
                Err(e) => {
                    tracing::error!(event_type = key, event_id = %event.id, error = %e, "Event handler panicked");
                }
            }
        }
    }
}

// ============================================
// Filters
// ============================================

/// Subscription filter; an empty list matches anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub agent_types: Vec<AgentType>,
    pub event_types: Vec<EventType>,
    pub project_prefixes: Vec<String>,
    pub session_ids: Vec<String>,
}

impl EventFilter {
    /// Check an event against the filter. `project_path` is the owning
    /// session's project, when known.
    pub fn matches(&self, event: &SessionEvent, project_path: Option<&str>) -> bool {
        if !self.agent_types.is_empty() && !self.agent_types.contains(&event.agent_type) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.session_ids.is_empty() && !self.session_ids.contains(&event.session_id) {
            return false;
        }
        if !self.project_prefixes.is_empty() {
            let Some(path) = project_path else {
                return false;
            };
            if !self.project_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                return false;
            }
        }
        true
    }

    pub fn needs_project(&self) -> bool {
        !self.project_prefixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    fn event(n: usize) -> SessionEvent {
        SessionEvent::new(format!("s-{}", n), EventType::Custom, AgentType::Custom)
            .with_content(&n.to_string())
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_every_event() {
        let bus = EventBus::new(100);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        for counter in [a.clone(), b.clone()] {
            bus.subscribe(WILDCARD, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        bus.start();

        for n in 0..25 {
            assert!(bus.publish(event(n)));
        }
        bus.shutdown().await;

        assert_eq!(a.load(Ordering::SeqCst), 25);
        assert_eq!(b.load(Ordering::SeqCst), 25);
        assert_eq!(bus.dispatched_count(), 25);
        assert_eq!(bus.dropped_count(), 0);
        assert!(!bus.publish(event(99)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let bus = EventBus::new(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(WILDCARD, move |e: SessionEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(e.content.unwrap_or_default());
                Ok(())
            }
        });

        // Consumer not running yet, so the queue fills up
        for n in 1..=5 {
            bus.publish(event(n));
        }
        assert_eq!(bus.pending_count(), 3);
        assert_eq!(bus.dropped_count(), 2);

        bus.start();
        bus.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec!["3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_siblings() {
        let bus = EventBus::new(10);
        let ok = Arc::new(AtomicUsize::new(0));
        bus.subscribe(WILDCARD, |_| async { Err(Error::Ipc("boom".into())) });
        bus.subscribe(WILDCARD, |_| async {
            if true {
                panic!("handler panic");
            }
            Ok(())
        });
        let counter = ok.clone();
        bus.subscribe(WILDCARD, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        bus.start();
        bus.publish(event(1));
        bus.publish(event(2));
        bus.shutdown().await;
        assert_eq!(ok.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_typed_subscription_and_unsubscribe() {
        let bus = EventBus::new(10);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe("prompt_received", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(SessionEvent::new("s", EventType::PromptReceived, AgentType::Aider));
        bus.publish(SessionEvent::new("s", EventType::ToolExecuted, AgentType::Aider));
        // Never started: shutdown flushes inline
        bus.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_filter() {
        let e = SessionEvent::new("s-1", EventType::FileRead, AgentType::Cursor);

        assert!(EventFilter::default().matches(&e, None));

        let by_agent = EventFilter {
            agent_types: vec![AgentType::Aider],
            ..Default::default()
        };
        assert!(!by_agent.matches(&e, None));

        let by_project = EventFilter {
            project_prefixes: vec!["/home/me/work".to_string()],
            event_types: vec![EventType::FileRead],
            ..Default::default()
        };
        assert!(by_project.matches(&e, Some("/home/me/work/api")));
        assert!(!by_project.matches(&e, Some("/tmp")));
        assert!(!by_project.matches(&e, None));

        let by_session = EventFilter {
            session_ids: vec!["s-2".to_string()],
            ..Default::default()
        };
        assert!(!by_session.matches(&e, None));
    }
}
