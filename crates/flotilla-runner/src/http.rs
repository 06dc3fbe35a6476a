//! HTTP model-server transport.

use crate::connection::{Connection, Connector, PoolKey, RemoteReply, TransportFailure};
use async_trait::async_trait;
use flotilla_core::agent::Endpoint;
use flotilla_core::ids::TaskId;
use flotilla_core::task::{RemoteStatus, TaskSpec};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Upper bound for a single request, independent of task timeouts.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Path probed for liveness, relative to the agent URL's host.
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_request_timeout_ms() -> u64 {
    600_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            health_path: default_health_path(),
        }
    }
}

/// Body sent to a model server.
#[derive(Debug, Serialize)]
struct TaskRequest<'a> {
    task_id: TaskId,
    capability: &'a str,
    payload: &'a serde_json::Value,
}

/// Opens one keep-alive HTTP session per pooled connection.
pub struct HttpConnector {
    config: HttpConfig,
}

impl HttpConnector {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, key: &PoolKey) -> Result<Box<dyn Connection>, TransportFailure> {
        let Endpoint::Url(raw) = &key.endpoint else {
            return Err(TransportFailure::new(format!(
                "endpoint {} is not an HTTP URL",
                key.endpoint
            )));
        };
        let url = Url::parse(raw)
            .map_err(|e| TransportFailure::new(format!("invalid agent URL {}: {}", raw, e)))?;

        // One idle socket per client so a pooled connection maps to one session.
        let client = Client::builder()
            .pool_max_idle_per_host(1)
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .build()
            .map_err(|e| TransportFailure::new(format!("failed to build HTTP client: {}", e)))?;

        let mut health_url = url.clone();
        health_url.set_path(&self.config.health_path);
        health_url.set_query(None);

        debug!(url = %url, "Opened HTTP connection");
        Ok(Box::new(HttpConnection {
            client,
            url,
            health_url,
            broken: false,
        }))
    }
}

struct HttpConnection {
    client: Client,
    url: Url,
    health_url: Url,
    broken: bool,
}

impl HttpConnection {
    fn transport_error(&mut self, err: reqwest::Error) -> TransportFailure {
        self.broken = true;
        TransportFailure::new(format!("request to {} failed: {}", self.url, err))
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn execute(
        &mut self,
        task_id: TaskId,
        task: &TaskSpec,
    ) -> Result<RemoteReply, TransportFailure> {
        let body = TaskRequest {
            task_id,
            capability: &task.capability,
            payload: &task.payload,
        };

        let response = match self.client.post(self.url.clone()).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.transport_error(e)),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Err(self.transport_error(e)),
        };

        if status.is_server_error() {
            warn!(url = %self.url, status = %status, "Model server error");
            return Err(TransportFailure::new(format!(
                "{} answered {}: {}",
                self.url, status, text
            )));
        }

        Ok(RemoteReply {
            output: text,
            status: RemoteStatus::Http(status.as_u16()),
        })
    }

    async fn probe(&mut self) -> Result<(), TransportFailure> {
        let response = match self.client.get(self.health_url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.transport_error(e)),
        };
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(TransportFailure::new(format!(
                "health endpoint {} not found",
                self.health_url
            ))),
            status => Err(TransportFailure::new(format!(
                "health check {} answered {}",
                self.health_url, status
            ))),
        }
    }

    fn is_broken(&mut self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) {
        debug!(url = %self.url, "Closed HTTP connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::agent::Transport;

    #[tokio::test]
    async fn test_connect_rejects_shell_endpoint() {
        let connector = HttpConnector::new(HttpConfig::default());
        let key = PoolKey::new(
            Transport::HttpModel,
            Endpoint::Shell {
                host: "build-01".to_string(),
                user: "ci".to_string(),
                port: 22,
            },
        );
        let err = connector.connect(&key).await.err().unwrap();
        assert!(err.message.contains("not an HTTP URL"));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let connector = HttpConnector::new(HttpConfig::default());
        let key = PoolKey::new(Transport::HttpModel, Endpoint::Url("not a url".to_string()));
        assert!(connector.connect(&key).await.is_err());
    }
}
