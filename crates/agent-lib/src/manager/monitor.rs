//! Event dispatch
//!
//! [`EventHandlers`] maps an event action to an async handler. The
//! [`EventMonitor`] consumes a runtime event stream and runs the matching
//! handler for each event as its own task.

use crate::models::WorkloadEventMessage;
use crate::observability::{AgentMetrics, StructuredLogger};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Async reaction to one event
pub type Handler = Arc<dyn Fn(WorkloadEventMessage) -> HandlerFuture + Send + Sync>;

/// Registry of action handlers; clones share the same table
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Handler>> {
        match self.handlers.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Install `handler` for `action`, replacing any previous one
    pub fn register(&self, action: impl Into<String>, handler: Handler) {
        self.table().insert(action.into(), handler);
    }

    /// Install an async closure as the handler for `action`
    pub fn register_fn<F, Fut>(&self, action: impl Into<String>, f: F)
    where
        F: Fn(WorkloadEventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(f(event)) as HandlerFuture);
        self.register(action, handler);
    }

    pub fn unregister(&self, action: &str) -> bool {
        self.table().remove(action).is_some()
    }

    pub fn get(&self, action: &str) -> Option<Handler> {
        self.table().get(action).cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.table().keys().cloned().collect();
        actions.sort();
        actions
    }
}

/// Dispatches runtime events to their handlers
pub struct EventMonitor {
    handlers: EventHandlers,
    tracker: TaskTracker,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl EventMonitor {
    pub fn new(handlers: EventHandlers, tracker: TaskTracker, logger: StructuredLogger) -> Self {
        Self {
            handlers,
            tracker,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Dispatch until the channel closes or `token` is cancelled.
    ///
    /// Queued events are not drained after cancellation.
    pub async fn watch(&self, mut events: mpsc::Receiver<WorkloadEventMessage>, token: CancellationToken) {
        info!(actions = ?self.handlers.actions(), "Event monitor started");

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.metrics.inc_events_received(&event.action);
            let Some(handler) = self.handlers.get(&event.action) else {
                debug!(workload_id = %event.id, action = %event.action, "Ignoring event");
                continue;
            };
            self.logger.log_workload_event(&event);
            self.tracker.spawn(handler(event));
        }

        info!("Event monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(id: &str, action: &str) -> WorkloadEventMessage {
        WorkloadEventMessage {
            id: id.into(),
            r#type: "container".into(),
            action: action.into(),
            time_nano: 0,
        }
    }

    fn counting_handlers(action: &str) -> (EventHandlers, Arc<AtomicUsize>) {
        let handlers = EventHandlers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        handlers.register_fn(action, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (handlers, hits)
    }

    #[test]
    fn test_register_and_unregister() {
        let (handlers, _) = counting_handlers("start");
        assert_eq!(handlers.actions(), vec!["start"]);
        assert!(handlers.get("start").is_some());
        assert!(handlers.unregister("start"));
        assert!(!handlers.unregister("start"));
        assert!(handlers.get("start").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_unknown_actions() {
        let (handlers, hits) = counting_handlers("start");
        let tracker = TaskTracker::new();
        let monitor = EventMonitor::new(handlers, tracker.clone(), StructuredLogger::new("node-1"));

        let (tx, rx) = mpsc::channel(8);
        tx.send(event("Rei", "start")).await.unwrap();
        tx.send(event("Rei", "pause")).await.unwrap();
        tx.send(event("Rei", "start")).await.unwrap();
        drop(tx);

        monitor.watch(rx, CancellationToken::new()).await;
        tracker.close();
        tracker.wait().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handlers_registered_while_running() {
        let handlers = EventHandlers::new();
        let tracker = TaskTracker::new();
        let monitor = Arc::new(EventMonitor::new(
            handlers.clone(),
            tracker.clone(),
            StructuredLogger::new("node-1"),
        ));
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let watcher = {
            let (monitor, token) = (monitor.clone(), token.clone());
            tokio::spawn(async move { monitor.watch(rx, token).await })
        };

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        handlers.register_fn("die", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tx.send(event("Asuka", "die")).await.unwrap();

        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
    }
}
