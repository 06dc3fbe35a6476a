//! NATS event bus for Flotilla.

mod bus;
pub mod config;
pub mod metrics;

pub use bus::NatsEventBus;
pub use config::NatsConfig;
pub use metrics::{BusMetrics, MetricsSnapshot};
