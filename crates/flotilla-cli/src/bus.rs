//! Event bus used when no NATS server is configured.

use async_trait::async_trait;
use flotilla_core::Result;
use flotilla_core::events::{BroadcastEventBus, Event};
use flotilla_core::ports::{EventBus, EventStream};
use tracing::info;

/// Logs every event and fans it out to in-process subscribers.
#[derive(Clone, Default)]
pub struct LoggingEventBus {
    inner: BroadcastEventBus,
}

impl LoggingEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for LoggingEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        let payload = serde_json::to_string(&event)?;
        info!(target: "flotilla::events", subject = %subject, event = %payload, "Event");
        self.inner.publish(event).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        self.inner.subscribe(pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::agent::Transport;
    use flotilla_core::events::PoolExhaustedPayload;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = LoggingEventBus::new();
        let mut stream = bus.subscribe("pool.>").await.unwrap();

        bus.publish(Event::PoolExhausted(PoolExhaustedPayload {
            transport: Transport::RemoteShell,
            endpoint: "ci@build-01:22".to_string(),
            max_per_key: 4,
            opened_transient: true,
            timestamp: chrono::Utc::now(),
        }))
        .await
        .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.subject(), "pool.remote_shell.exhausted");
    }
}
