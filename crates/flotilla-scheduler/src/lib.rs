//! Agent routing, health tracking and workflow orchestration for Flotilla.

pub mod config;
pub mod dag;
pub mod health;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod router;
pub mod workflow;

pub use config::SchedulerConfig;
pub use dag::{DagError, WorkflowDag};
pub use health::{CircuitBreaker, HealthMonitor, HealthPolicy, Observation};
pub use orchestrator::{Orchestrator, StatusSnapshot};
pub use queue::{QueuedTask, WaitQueue};
pub use registry::{AgentRegistry, Reservation};
pub use router::{FallbackPolicy, Router, RouterConfig, RoutingRule};
pub use workflow::WorkflowRun;
