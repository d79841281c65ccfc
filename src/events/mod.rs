//! Typed publish/subscribe over a [`Broker`], with durable audit logging.
//!
//! An [`EventBus`] is constructed once at process start and shared by
//! reference (`Arc<EventBus>`) with every component that publishes or
//! subscribes. It owns the handler table (event type → handlers in
//! registration order) and the single broker subscription feeding it.
//!
//! Delivery is at-least-once. Events published one after another from the
//! same call site reach handlers in publish order, because `publish` only
//! returns after the broker accepted the message and the receive loop
//! handles one message at a time.

mod broker;

pub use broker::*;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::error::BrokerError;
use crate::models::{AgentEvent, EventPayload, EventType};

/// Reacts to one delivered event.
///
/// Returning an error (or panicking) is contained: it is logged as a
/// `HANDLER_ERROR` audit entry and the remaining handlers still run.
///
/// Handlers run on the receive loop, which is also the consumer of the bus's
/// own subscription. Work that publishes back to the same bus belongs on a
/// spawned task; awaiting such a publish inside `handle` can wait forever
/// once the subscription queue is full.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(AgentEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(AgentEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Outcome of a publish that reached the broker.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub event: AgentEvent,
    /// Set when the audit-log write failed. The event was still delivered.
    pub audit_error: Option<String>,
}

pub struct EventBus {
    broker: Arc<dyn Broker>,
    db: Database,
    channel: String,
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, db: Database, channel: impl Into<String>) -> Self {
        Self {
            broker,
            db,
            channel: channel.into(),
            handlers: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Append the event to the audit log and push it to the broker.
    ///
    /// A failed audit write is logged and reported on the receipt; only a
    /// broker failure fails the publish.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<PublishReceipt, BrokerError> {
        let event = AgentEvent::new(event_type, payload);
        let message = serde_json::to_string(&event)?;

        let audit_error = match self.db.insert_agent_log(&event) {
            Ok(_) => None,
            Err(e) => {
                tracing::error!(
                    event_type = %event_type,
                    project_id = %event.payload.project_id,
                    "Failed to write audit log entry: {:#}",
                    e
                );
                Some(e.to_string())
            }
        };

        self.broker.publish(&self.channel, message).await?;
        tracing::debug!(event_type = %event_type, "Published event");

        Ok(PublishReceipt { event, audit_error })
    }

    /// Register a handler for exactly one event type.
    ///
    /// Handlers of the same type run in registration order.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().expect("handler table poisoned");
        handlers.entry(event_type).or_default().push(handler);
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        let handlers = self.handlers.read().expect("handler table poisoned");
        handlers.get(&event_type).map_or(0, Vec::len)
    }

    /// Open the broker subscription and start the receive loop.
    ///
    /// Idempotent: returns `Ok(false)` with a warning when the loop is already
    /// running.
    pub async fn start_listening(self: &Arc<Self>) -> Result<bool, BrokerError> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!("Event bus is already listening on {}", self.channel);
            return Ok(false);
        }

        let mut subscription = self.broker.subscribe(&self.channel).await?;
        let bus: Weak<Self> = Arc::downgrade(self);

        *listener = Some(tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                match serde_json::from_str::<AgentEvent>(&raw) {
                    Ok(event) => {
                        bus.dispatch(&event).await;
                    }
                    Err(e) => tracing::warn!("Dropping undecodable event: {}", e),
                }
            }
            tracing::debug!("Event bus receive loop ended");
        }));

        tracing::info!("Event bus listening on {}", self.channel);
        Ok(true)
    }

    /// Abort the receive loop. A later `start_listening` opens a fresh one.
    pub async fn stop_listening(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }

    /// Run every handler registered for the event's type, one after another.
    ///
    /// Returns the number of handlers that failed.
    pub async fn dispatch(&self, event: &AgentEvent) -> usize {
        let handlers = {
            let table = self.handlers.read().expect("handler table poisoned");
            table.get(&event.event_type).cloned().unwrap_or_default()
        };

        let mut failures = 0;
        for (index, handler) in handlers.into_iter().enumerate() {
            let owned = event.clone();
            // Spawned so that a panicking handler surfaces as a JoinError
            // instead of unwinding through the receive loop.
            let outcome = tokio::spawn(async move { handler.handle(&owned).await }).await;

            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(join_error) => format!("handler panicked: {}", join_error),
            };

            failures += 1;
            tracing::error!(
                event_type = %event.event_type,
                handler = index,
                "Event handler failed: {}",
                error
            );
            self.record_handler_error(event, &error);
        }

        failures
    }

    fn record_handler_error(&self, event: &AgentEvent, error: &str) {
        let mut payload = event.payload.clone();
        payload.fields = serde_json::Map::new();
        let payload = payload
            .with("eventType", event.event_type.as_str())
            .with("error", error);

        let entry = AgentEvent::new(EventType::HandlerError, payload);
        if let Err(e) = self.db.insert_agent_log(&entry) {
            tracing::error!("Failed to record handler error: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    use crate::models::CreateProjectInput;

    fn setup() -> (Arc<EventBus>, Database, Uuid) {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let project = db
            .create_project(CreateProjectInput {
                name: "Bus".to_string(),
                description: None,
            })
            .unwrap();
        let bus = Arc::new(EventBus::new(
            Arc::new(InMemoryBroker::new(64)),
            db.clone(),
            "test-events",
        ));
        (bus, db, project.id)
    }

    fn recorder(log: Arc<StdMutex<Vec<String>>>, label: &'static str) -> Arc<dyn EventHandler> {
        Arc::new(handler_fn(move |event: AgentEvent| {
            let log = log.clone();
            async move {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}", label, event.event_type));
                Ok::<(), anyhow::Error>(())
            }
        }))
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: &AgentEvent) -> anyhow::Result<()> {
            panic!("handler exploded")
        }
    }

    async fn wait_for_len(log: &Arc<StdMutex<Vec<String>>>, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while log.lock().unwrap().len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handlers did not run in time");
    }

    #[tokio::test]
    async fn test_publish_writes_audit_log() {
        let (bus, db, project_id) = setup();

        let receipt = bus
            .publish(
                EventType::TaskCreated,
                EventPayload::project(project_id).with("title", "T1"),
            )
            .await
            .unwrap();

        assert!(receipt.audit_error.is_none());
        let logs = db.get_agent_logs(project_id, None).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event_type, EventType::TaskCreated);
        assert_eq!(logs[0].payload["title"], "T1");
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_publish() {
        let (bus, db, project_id) = setup();
        db.execute_batch("DROP TABLE agent_logs").unwrap();

        let receipt = bus
            .publish(EventType::ExecutionStarted, EventPayload::project(project_id))
            .await
            .expect("publish should still succeed");

        assert!(receipt.audit_error.is_some());
    }

    #[tokio::test]
    async fn test_broker_failure_fails_publish() {
        let (_, db, project_id) = setup();
        let broker = Arc::new(InMemoryBroker::new(8));
        let bus = EventBus::new(broker.clone(), db.clone(), "closed-events");
        broker.close();

        let result = bus
            .publish(EventType::TaskCreated, EventPayload::project(project_id))
            .await;

        assert!(matches!(result, Err(BrokerError::Publish { .. })));
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (bus, _db, project_id) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(EventType::TaskCreated, recorder(log.clone(), "first"));
        bus.subscribe(EventType::TaskCreated, recorder(log.clone(), "second"));

        let event = AgentEvent::new(EventType::TaskCreated, EventPayload::project(project_id));
        assert_eq!(bus.dispatch(&event).await, 0);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:TASK_CREATED", "second:TASK_CREATED"]
        );
    }

    #[tokio::test]
    async fn test_sequential_publishes_are_delivered_in_order() {
        let (bus, _db, project_id) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(EventType::TaskCreated, recorder(log.clone(), "h"));
        bus.subscribe(EventType::TasksCreated, recorder(log.clone(), "h"));
        bus.start_listening().await.unwrap();

        bus.publish(EventType::TaskCreated, EventPayload::project(project_id))
            .await
            .unwrap();
        bus.publish(EventType::TasksCreated, EventPayload::project(project_id))
            .await
            .unwrap();

        wait_for_len(&log, 2).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["h:TASK_CREATED", "h:TASKS_CREATED"]
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others_or_the_loop() {
        let (bus, db, project_id) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.subscribe(
            EventType::ExecutionFailed,
            Arc::new(handler_fn(|_event: AgentEvent| async {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })),
        );
        bus.subscribe(EventType::ExecutionFailed, recorder(log.clone(), "after"));
        bus.start_listening().await.unwrap();

        bus.publish(EventType::ExecutionFailed, EventPayload::project(project_id))
            .await
            .unwrap();
        bus.publish(EventType::ExecutionFailed, EventPayload::project(project_id))
            .await
            .unwrap();

        wait_for_len(&log, 2).await;

        let handler_errors: Vec<_> = db
            .get_agent_logs(project_id, None)
            .unwrap()
            .into_iter()
            .filter(|l| l.event_type == EventType::HandlerError)
            .collect();
        assert_eq!(handler_errors.len(), 2);
        assert_eq!(handler_errors[0].payload["eventType"], "EXECUTION_FAILED");
        assert!(handler_errors[0].payload["error"]
            .as_str()
            .unwrap()
            .contains("boom"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let (bus, _db, project_id) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.subscribe(EventType::PhaseFailed, Arc::new(PanickingHandler));
        bus.subscribe(EventType::PhaseFailed, recorder(log.clone(), "survivor"));

        let event = AgentEvent::new(EventType::PhaseFailed, EventPayload::project(project_id));
        assert_eq!(bus.dispatch(&event).await, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_listening_is_idempotent() {
        let (bus, _db, project_id) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(EventType::StoryCompleted, recorder(log.clone(), "once"));

        assert!(bus.start_listening().await.unwrap());
        assert!(!bus.start_listening().await.unwrap());

        bus.publish(EventType::StoryCompleted, EventPayload::project(project_id))
            .await
            .unwrap();
        wait_for_len(&log, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A second subscription would have delivered the event twice.
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
