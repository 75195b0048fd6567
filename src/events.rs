//! Event Bus (§4.10): best-effort in-process pub/sub over
//! `tokio::sync::broadcast`. A slow subscriber drops lag, never blocks
//! the publisher; correctness never depends on delivery. The bus itself
//! never touches the Store — `record` below is the audit-side companion
//! callers use alongside `publish` when an event also belongs in
//! `system_events` for analytics.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::SystemEvent;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    AgentWentOffline { agent_id: Uuid },
    SafetyViolation { tenant_id: Uuid, severity: String },
    EmergencyTriggered { agent_id: Uuid, notice: String },
    SwitchCompleted { agent_id: Uuid, savings_per_hour: f64 },
    PriceSamplesDropped { pool_id: String, dropped: u32 },
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::AgentWentOffline { .. } => "agent_went_offline",
            Event::SafetyViolation { .. } => "safety_violation",
            Event::EmergencyTriggered { .. } => "emergency_triggered",
            Event::SwitchCompleted { .. } => "switch_completed",
            Event::PriceSamplesDropped { .. } => "price_samples_dropped",
        }
    }

    fn tenant_id(&self) -> Option<Uuid> {
        match self {
            Event::SafetyViolation { tenant_id, .. } => Some(*tenant_id),
            _ => None,
        }
    }
}

/// Persists `event` to `system_events` and fans it out on the in-memory
/// bus. Persistence failure is logged, not propagated: a dropped audit
/// row must never block the caller's own request path.
pub async fn record<S: Store>(store: &S, events: &EventBus, event: Event) {
    let row = SystemEvent {
        id: Uuid::new_v4(),
        tenant_id: event.tenant_id(),
        kind: event.kind().to_string(),
        payload: serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        created_at: chrono::Utc::now(),
    };
    if let Err(err) = store.insert_system_event(row).await {
        tracing::warn!(%err, kind = event.kind(), "failed to persist system event");
    }
    events.publish(event);
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // `send` only errors when there are no subscribers; that is not
        // a failure condition for a best-effort bus.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
