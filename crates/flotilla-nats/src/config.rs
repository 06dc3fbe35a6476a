//! Configuration for the NATS event bus.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the NATS event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URLs (several for a cluster).
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,
    /// Prepended to every event subject, e.g. `flotilla.task.<id>.completed`.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Maximum reconnection attempts. Unlimited when unset.
    #[serde(default)]
    pub max_reconnects: Option<usize>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

fn default_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_subject_prefix() -> String {
    "flotilla".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_urls(),
            subject_prefix: default_subject_prefix(),
            max_reconnects: None,
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnects = Some(max);
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Full NATS subject for an event subject.
    pub fn subject(&self, subject: &str) -> String {
        if self.subject_prefix.is_empty() {
            subject.to_string()
        } else {
            format!("{}.{}", self.subject_prefix, subject)
        }
    }
}
