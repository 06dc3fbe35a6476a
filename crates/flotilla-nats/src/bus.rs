//! NATS-based event bus.

use async_trait::async_trait;
use flotilla_core::events::Event;
use flotilla_core::ports::{EventBus, EventStream};
use flotilla_core::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::NatsConfig;
use crate::metrics::BusMetrics;

/// Publishes orchestration events as JSON on core NATS subjects.
///
/// Delivery is at-most-once; subscribers only see events published while
/// they are connected.
#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
    config: NatsConfig,
    metrics: Arc<BusMetrics>,
}

impl NatsEventBus {
    /// Connect to a single NATS server with default settings.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let urls = config.urls.join(",");
        info!(urls = %urls, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout())
            .max_reconnects(config.max_reconnects)
            .connect(urls.as_str())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;

        let metrics = BusMetrics::new();
        metrics.set_connected(true);
        info!(prefix = %config.subject_prefix, "Connected to NATS");

        Ok(Self {
            client,
            config,
            metrics,
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Flush pending publishes and drain the connection.
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.client.flush().await {
            error!(error = %e, "Error flushing NATS connection");
        }
        if let Err(e) = self.client.drain().await {
            error!(error = %e, "Error draining NATS connection");
        }
        self.metrics.set_connected(false);
        info!("NATS connection drained");
        Ok(())
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = self.config.subject(&event.subject());
        let payload = serde_json::to_vec(&event)?;
        let payload_len = payload.len() as u64;

        debug!(subject = %subject, "Publishing event");
        match self.client.publish(subject.clone(), payload.into()).await {
            Ok(()) => {
                self.metrics.record_publish(payload_len);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )))
            }
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let subject = self.config.subject(pattern);
        debug!(subject = %subject, "Subscribing");

        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to subscribe: {}", e)))?;

        let metrics = Arc::clone(&self.metrics);
        let stream = subscriber.map(move |msg| {
            metrics.record_receive();
            serde_json::from_slice::<Event>(&msg.payload).map_err(|e| {
                metrics.record_decode_failure();
                Error::Serialization(e.to_string())
            })
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_connect() {
        let bus = NatsEventBus::connect("nats://localhost:4222").await;
        assert!(bus.is_ok());
        assert!(bus.unwrap().metrics().snapshot().connected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_event_bus_error() {
        let config = NatsConfig {
            connection_timeout_ms: 200,
            max_reconnects: Some(0),
            ..NatsConfig::new("nats://127.0.0.1:1")
        };
        let err = NatsEventBus::connect_with_config(config).await.err().unwrap();
        assert!(matches!(err, Error::EventBus(_)));
    }
}
