//! Event bus: in-process publish/subscribe with bounded history.
//!
//! Events fan out over a broadcast channel. Stream consumers (the WebSocket
//! broadcaster) take a raw receiver; callback subscribers get a detached
//! consumer task per handler, so a slow or failing handler can never block
//! emission or other handlers. Within one handler, events arrive in emission
//! order; across handlers no ordering is guaranteed.

use crate::adapters::sqlite::Store;
use crate::domain::models::BrewEvent;
use crate::domain::ports::Clock;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// An emitted event with its envelope metadata.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub event: BrewEvent,
}

impl EventEnvelope {
    /// Wire form: `{type, data}` as sent to the dashboard.
    pub fn wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.event.kind(),
            "data": self.event.data(),
        })
    }
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity.
    pub channel_capacity: usize,
    /// Bounded in-memory history length (drop-oldest).
    pub history_limit: usize,
    /// Whether to append every event to the persistent log.
    pub persist_events: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_limit: 5000,
            persist_events: true,
        }
    }
}

/// Central event bus.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    history: RwLock<VecDeque<EventEnvelope>>,
    store: Option<Store>,
    clock: Arc<dyn Clock>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
            store: None,
            clock,
            config,
        }
    }

    /// Attach the persistent event log.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish an event to all subscribers, record it in history, and append
    /// it to the persistent log. Persistence failures are logged, never
    /// surfaced to the emitter.
    pub async fn emit(&self, event: BrewEvent) {
        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            created_at: self.clock.now(),
            event,
        };

        {
            let mut history = self.history.write().await;
            history.push_back(envelope.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        if self.config.persist_events {
            if let Some(ref store) = self.store {
                let e = &envelope.event;
                if let Err(err) = store
                    .append_event(e.kind(), e.task_id(), e.group_id(), e.agent_id(), &e.data())
                    .await
                {
                    warn!(error = %err, kind = e.kind(), "Failed to persist event");
                }
            }
        }

        // No subscribers is fine.
        let _ = self.sender.send(envelope);
    }

    /// Raw stream subscription (used by the WebSocket broadcaster).
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Register an async handler for events of the given kind; `"*"`
    /// subscribes to everything. The handler runs on its own detached task:
    /// it observes events in emission order, and its errors are logged and
    /// swallowed. Returns the consumer task handle (aborted on drop of the
    /// caller's choosing).
    pub fn subscribe_handler<F, Fut>(&self, filter: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let filter = filter.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if filter != "*" && envelope.event.kind() != filter {
                            continue;
                        }
                        if let Err(err) = handler(envelope).await {
                            warn!(error = %err, filter = %filter, "Event handler failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, filter = %filter, "Event handler lagged, skipping");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// The last N emitted events, oldest first.
    pub async fn history(&self) -> Vec<EventEnvelope> {
        self.history.read().await.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::clock::system_clock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> EventBus {
        EventBus::new(
            EventBusConfig {
                persist_events: false,
                ..EventBusConfig::default()
            },
            system_clock(),
        )
    }

    fn recovered(task_id: &str) -> BrewEvent {
        BrewEvent::TaskRecovered {
            task_id: task_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_stream_subscription_receives_events() {
        let bus = bus();
        let mut rx = bus.subscribe();

        bus.emit(recovered("CD-001")).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.kind(), "task.recovered");
        assert_eq!(envelope.wire()["data"]["task_id"], "CD-001");
    }

    #[tokio::test]
    async fn test_handler_filtering_and_wildcard() {
        let bus = bus();
        let matched = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let m = matched.clone();
        let handle_a = bus.subscribe_handler("task.recovered", move |_| {
            let m = m.clone();
            async move {
                m.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let a = all.clone();
        let handle_b = bus.subscribe_handler("*", move |_| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit(recovered("CD-001")).await;
        bus.emit(BrewEvent::AgentStopped {
            instance_id: "coder-1".into(),
        })
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(matched.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        handle_a.abort();
        handle_b.abort();
    }

    #[tokio::test]
    async fn test_handler_errors_are_swallowed() {
        let bus = bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = bus.subscribe_handler("*", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("handler exploded")
            }
        });

        bus.emit(recovered("CD-001")).await;
        bus.emit(recovered("CD-002")).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The failing handler keeps receiving subsequent events.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn test_history_drop_oldest() {
        let bus = EventBus::new(
            EventBusConfig {
                history_limit: 3,
                persist_events: false,
                ..EventBusConfig::default()
            },
            system_clock(),
        );

        for i in 0..5 {
            bus.emit(recovered(&format!("CD-{i:03}"))).await;
        }

        let history = bus.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event.task_id(), Some("CD-002"));
        assert_eq!(history[2].event.task_id(), Some("CD-004"));
    }
}
