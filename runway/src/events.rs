use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::request::ComputeTier;
use crate::run::{RunContext, RunId, RunKey, RunState};

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub run_key: RunKey,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    /// Events of one run share its id as correlation id.
    pub fn new(run_id: RunId, run_key: RunKey) -> Self {
        Self {
            version: 1,
            correlation_id: run_id.as_uuid(),
            run_key,
            timestamp: Utc::now(),
        }
    }

    pub fn for_run(ctx: &RunContext) -> Self {
        Self::new(ctx.run_id, ctx.run_key.clone())
    }
}

/// Run lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn new(ctx: &RunContext, payload: RunEventPayload) -> Self {
        Self {
            meta: EventMeta::for_run(ctx),
            payload,
        }
    }
}

/// Event payload emitted for run lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// A run was triggered and claimed its key.
    Triggered {
        run_id: RunId,
        runner_count: u32,
        compute_tier: ComputeTier,
    },
    /// A newer trigger for the same key took over.
    Superseded { run_id: RunId, by: RunId },
    /// The run moved between states.
    Transitioned {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },
    /// The provisioning request left for the backend.
    DispatchSent { run_id: RunId },
    /// The backend confirmed the runner.
    Confirmed { run_id: RunId, status_code: i64 },
    /// The run failed at `stage`.
    Failed {
        run_id: RunId,
        stage: String,
        reason: String,
    },
    /// The consumer job ended.
    ConsumerFinished {
        run_id: RunId,
        success: bool,
        exit_code: Option<i32>,
    },
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Publisher of run lifecycle events.
pub trait RunEventPublisher: EventPublisher<RunEvent> {}

impl<T> RunEventPublisher for T where T: EventPublisher<RunEvent> {}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for subscribers. A subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged`. With no
/// subscribers events are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn publish_run(&self, event: RunEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher<RunEvent> for InProcEventBus {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        self.publish_run(event)
    }
}

impl EventSubscriber<RunEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.subscribe_runs()
    }
}
