//! Pooled remote execution layer for Flotilla.
//!
//! Agents are reached over one of two transports. Each transport keeps a
//! bounded pool of reusable connections per `(transport, endpoint)` key, and
//! every dispatch runs through the same retry loop: a failed or timed-out
//! attempt always throws its connection away before the next one starts.

pub mod connection;
pub mod executor;
pub mod http;
pub mod pool;
pub mod retry;
pub mod shell;

pub use connection::{Connection, Connector, PoolKey, RemoteReply, TransportFailure};
pub use executor::{
    ExecutionConfig, ExecutionLayer, HttpExecutor, RemoteExecutor, ShellExecutor,
    execute_with_retry,
};
pub use http::{HttpConfig, HttpConnector};
pub use pool::{ConnectionPool, ExhaustionPolicy, PoolConfig, PoolStats, PooledConnection};
pub use retry::{Backoff, RetryPolicy, Sleeper, TokioSleeper};
pub use shell::{ShellConfig, ShellConnector, shell_command};
