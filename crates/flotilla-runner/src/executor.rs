//! Execution layer: pooled, retried, cancellable dispatch to agents.

use crate::connection::{Connector, PoolKey, TransportFailure};
use crate::http::{HttpConfig, HttpConnector};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::shell::{ShellConfig, ShellConnector, shell_command};
use async_trait::async_trait;
use flotilla_core::agent::{AgentDescriptor, Transport};
use flotilla_core::events::{EventEmitter, EvictionReason};
use flotilla_core::ports::{DispatchContext, Prober, TaskDispatcher};
use flotilla_core::task::{ExecutionOutput, TaskSpec};
use flotilla_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for the whole execution layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Resolves once `cancel` flips to `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn cancelled_error() -> Error {
    Error::Cancelled {
        reason: "cancelled during execution".to_string(),
    }
}

/// One attempt: acquire, run, and either release or discard the connection.
async fn run_attempt(
    pool: &ConnectionPool,
    key: &PoolKey,
    task: &TaskSpec,
    ctx: &mut DispatchContext,
    attempt: u32,
) -> std::result::Result<crate::connection::RemoteReply, TransportFailure> {
    let mut conn = pool.acquire(key).await?;
    ctx.mark_started(attempt);

    let result = conn.connection()?.execute(ctx.task_id, task).await;
    match result {
        Ok(reply) => {
            conn.release();
            Ok(reply)
        }
        Err(failure) => {
            conn.discard(EvictionReason::Errored);
            Err(failure)
        }
    }
}

/// Run `task` against `key` with timeout, cancellation and retries.
///
/// Every attempt is bounded by the task timeout, covering both acquisition
/// and execution. A timed-out or cancelled attempt drops its connection guard,
/// which discards the connection. Non-success remote statuses are returned as
/// output and never retried.
pub async fn execute_with_retry(
    pool: &ConnectionPool,
    key: &PoolKey,
    task: &TaskSpec,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    ctx: &mut DispatchContext,
) -> Result<ExecutionOutput> {
    let max_attempts = task.max_attempts();
    let timeout = task.timeout();
    let mut cancel = ctx.cancel.clone();
    let task_id = ctx.task_id;

    let mut attempt = 1;
    loop {
        if ctx.is_cancelled() {
            return Err(cancelled_error());
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(cancelled_error()),
            outcome = tokio::time::timeout(timeout, run_attempt(pool, key, task, ctx, attempt)) => outcome,
        };

        let err = match outcome {
            Ok(Ok(reply)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(task_id = %task_id, key = %key, attempt, status = %reply.status, duration_ms, "Attempt finished");
                return Ok(ExecutionOutput {
                    output: reply.output,
                    status: reply.status,
                    duration_ms,
                    attempts: attempt,
                });
            }
            Ok(Err(failure)) => Error::Transport {
                attempt,
                message: failure.message,
            },
            Err(_) => Error::Timeout {
                attempt,
                timeout_ms: task.timeout_ms,
            },
        };

        if attempt >= max_attempts {
            warn!(task_id = %task_id, key = %key, attempt, error = %err, "Giving up after final attempt");
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            task_id = %task_id,
            key = %key,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(cancelled_error()),
            _ = sleeper.sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Executor for HTTP model servers.
#[derive(Clone)]
pub struct HttpExecutor {
    pool: ConnectionPool,
}

impl HttpExecutor {
    pub fn new(http: HttpConfig, pool: PoolConfig, events: EventEmitter) -> Self {
        Self::with_connector(Arc::new(HttpConnector::new(http)), pool, events)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        pool: PoolConfig,
        events: EventEmitter,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(connector, pool, events),
        }
    }
}

/// Executor for remote-shell agents.
#[derive(Clone)]
pub struct ShellExecutor {
    pool: ConnectionPool,
}

impl ShellExecutor {
    pub fn new(shell: ShellConfig, pool: PoolConfig, events: EventEmitter) -> Self {
        Self::with_connector(Arc::new(ShellConnector::new(shell)), pool, events)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        pool: PoolConfig,
        events: EventEmitter,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(connector, pool, events),
        }
    }
}

/// Transport-specific executor behind one `execute` contract.
#[derive(Clone)]
pub enum RemoteExecutor {
    Http(HttpExecutor),
    Shell(ShellExecutor),
}

impl RemoteExecutor {
    pub fn transport(&self) -> Transport {
        match self {
            RemoteExecutor::Http(_) => Transport::HttpModel,
            RemoteExecutor::Shell(_) => Transport::RemoteShell,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        match self {
            RemoteExecutor::Http(e) => &e.pool,
            RemoteExecutor::Shell(e) => &e.pool,
        }
    }

    /// Reject payloads the transport cannot run before touching the pool.
    pub fn validate(&self, task: &TaskSpec) -> Result<()> {
        match self {
            RemoteExecutor::Http(_) => Ok(()),
            RemoteExecutor::Shell(_) => shell_command(&task.payload).map(|_| ()),
        }
    }

    pub async fn execute(
        &self,
        agent: &AgentDescriptor,
        task: &TaskSpec,
        policy: &RetryPolicy,
        sleeper: &dyn Sleeper,
        ctx: &mut DispatchContext,
    ) -> Result<ExecutionOutput> {
        self.validate(task)?;
        let key = PoolKey::for_agent(agent);
        execute_with_retry(self.pool(), &key, task, policy, sleeper, ctx).await
    }

    /// Health-check an agent without taking one of its pooled slots.
    pub async fn probe(&self, agent: &AgentDescriptor) -> Result<()> {
        self.pool()
            .probe(&PoolKey::for_agent(agent))
            .await
            .map_err(|failure| Error::Transport {
                attempt: 1,
                message: failure.message,
            })
    }

    /// Close pooled connections to an agent that is gone.
    pub async fn forget(&self, agent: &AgentDescriptor) {
        let key = PoolKey::for_agent(agent);
        debug!(agent_id = %agent.id, key = %key, "Dropping pooled connections");
        self.pool().evict_key(&key).await;
    }
}

/// The pooled remote execution layer used by the orchestrator.
pub struct ExecutionLayer {
    http: RemoteExecutor,
    shell: RemoteExecutor,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ExecutionLayer {
    pub fn new(config: ExecutionConfig, events: EventEmitter) -> Self {
        let http = HttpExecutor::new(config.http, config.pool.clone(), events.clone());
        let shell = ShellExecutor::new(config.shell, config.pool, events);
        Self::with_executors(
            RemoteExecutor::Http(http),
            RemoteExecutor::Shell(shell),
            config.retry,
        )
    }

    pub fn with_executors(http: RemoteExecutor, shell: RemoteExecutor, retry: RetryPolicy) -> Self {
        Self {
            http,
            shell,
            retry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn executor(&self, transport: Transport) -> &RemoteExecutor {
        match transport {
            Transport::HttpModel => &self.http,
            Transport::RemoteShell => &self.shell,
        }
    }

    pub fn pool_stats(&self, transport: Transport) -> PoolStats {
        self.executor(transport).pool().stats()
    }

    /// Close both pools. In-flight connections close when released.
    pub async fn shutdown(&self) {
        self.http.pool().close().await;
        self.shell.pool().close().await;
        info!("Execution layer shut down");
    }
}

#[async_trait]
impl TaskDispatcher for ExecutionLayer {
    async fn dispatch(
        &self,
        agent: &AgentDescriptor,
        task: &TaskSpec,
        mut ctx: DispatchContext,
    ) -> Result<ExecutionOutput> {
        let executor = self.executor(agent.transport);
        debug!(task_id = %ctx.task_id, agent_id = %agent.id, transport = %executor.transport(), "Dispatching task");
        executor
            .execute(agent, task, &self.retry, self.sleeper.as_ref(), &mut ctx)
            .await
    }

    async fn forget_agent(&self, agent: &AgentDescriptor) {
        self.executor(agent.transport).forget(agent).await;
    }
}

#[async_trait]
impl Prober for ExecutionLayer {
    async fn probe(&self, agent: &AgentDescriptor) -> Result<()> {
        self.executor(agent.transport).probe(agent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, RemoteReply};
    use crate::pool::ExhaustionPolicy;
    use flotilla_core::agent::Endpoint;
    use flotilla_core::ids::TaskId;
    use flotilla_core::task::RemoteStatus;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Hang,
        Fail,
        Exit(i32),
    }

    #[derive(Default)]
    struct Script {
        behaviors: Mutex<VecDeque<Behavior>>,
        connects: AtomicUsize,
    }

    impl Script {
        fn new(behaviors: &[Behavior]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: Mutex::new(behaviors.iter().copied().collect()),
                connects: AtomicUsize::new(0),
            })
        }

        fn next(&self) -> Behavior {
            self.behaviors
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Behavior::Exit(0))
        }
    }

    struct ScriptedConnection {
        script: Arc<Script>,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn execute(
            &mut self,
            _task_id: TaskId,
            _task: &TaskSpec,
        ) -> std::result::Result<RemoteReply, TransportFailure> {
            match self.script.next() {
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Fail => Err(TransportFailure::new("connection reset")),
                Behavior::Exit(code) => Ok(RemoteReply {
                    output: format!("exit {}", code),
                    status: RemoteStatus::Exit(code),
                }),
            }
        }

        async fn probe(&mut self) -> std::result::Result<(), TransportFailure> {
            Ok(())
        }

        fn is_broken(&mut self) -> bool {
            false
        }

        async fn close(self: Box<Self>) {}
    }

    struct ScriptedConnector(Arc<Script>);

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            _key: &PoolKey,
        ) -> std::result::Result<Box<dyn Connection>, TransportFailure> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedConnection {
                script: Arc::clone(&self.0),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn shell_agent() -> AgentDescriptor {
        AgentDescriptor::new(
            "test-runner-1",
            Transport::RemoteShell,
            Endpoint::Shell {
                host: "build-01".to_string(),
                user: "ci".to_string(),
                port: 22,
            },
        )
        .with_capability("testing")
    }

    fn shell_executor(script: &Arc<Script>) -> RemoteExecutor {
        RemoteExecutor::Shell(ShellExecutor::with_connector(
            Arc::new(ScriptedConnector(Arc::clone(script))),
            PoolConfig::default().with_exhaustion_policy(ExhaustionPolicy::Block),
            EventEmitter::disabled(),
        ))
    }

    fn context() -> (DispatchContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (DispatchContext::new(TaskId::new(), rx), tx)
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries_and_leave_pool_empty() {
        let script = Script::new(&[Behavior::Hang, Behavior::Hang]);
        let executor = shell_executor(&script);
        let sleeper = RecordingSleeper::default();
        let task = TaskSpec::new("testing", json!("cargo test"))
            .with_timeout(Duration::from_millis(50))
            .with_max_retries(2);
        let (mut ctx, _cancel) = context();

        let err = executor
            .execute(&shell_agent(), &task, &RetryPolicy::fixed(Duration::from_millis(5)), &sleeper, &mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { attempt: 2, timeout_ms: 50 }));
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
        assert_eq!(*sleeper.delays.lock().unwrap(), vec![Duration::from_millis(5)]);

        let key = PoolKey::for_agent(&shell_agent());
        assert_eq!(executor.pool().idle_count(&key), 0);
        assert_eq!(executor.pool().in_use(&key), 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_retried_on_fresh_connection() {
        let script = Script::new(&[Behavior::Fail, Behavior::Exit(0)]);
        let executor = shell_executor(&script);
        let task = TaskSpec::new("testing", json!({ "command": "make" })).with_max_retries(3);
        let (mut ctx, _cancel) = context();

        let output = executor
            .execute(&shell_agent(), &task, &RetryPolicy::immediate(), &RecordingSleeper::default(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(output.attempts, 2);
        assert_eq!(output.status, RemoteStatus::Exit(0));
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);

        let key = PoolKey::for_agent(&shell_agent());
        assert_eq!(executor.pool().idle_count(&key), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_is_not_retried() {
        let script = Script::new(&[Behavior::Exit(2)]);
        let executor = shell_executor(&script);
        let task = TaskSpec::new("testing", json!("false")).with_max_retries(3);
        let (mut ctx, _cancel) = context();

        let output = executor
            .execute(&shell_agent(), &task, &RetryPolicy::immediate(), &RecordingSleeper::default(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(output.attempts, 1);
        assert_eq!(output.status, RemoteStatus::Exit(2));
    }

    #[tokio::test]
    async fn test_invalid_payload_never_touches_pool() {
        let script = Script::new(&[]);
        let executor = shell_executor(&script);
        let task = TaskSpec::new("testing", json!(42));
        let (mut ctx, _cancel) = context();

        let err = executor
            .execute(&shell_agent(), &task, &RetryPolicy::immediate(), &RecordingSleeper::default(), &mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidPayload(_)));
        assert_eq!(script.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_attempt() {
        let script = Script::new(&[Behavior::Hang]);
        let executor = shell_executor(&script);
        let task = TaskSpec::new("testing", json!("sleep 600"));
        let (started_tx, started_rx) = oneshot::channel();
        let (ctx, cancel) = context();
        let mut ctx = ctx.with_started(started_tx);

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(&shell_agent(), &task, &RetryPolicy::immediate(), &TokioSleeper, &mut ctx)
                    .await
            })
        };

        assert_eq!(started_rx.await.unwrap(), 1);
        cancel.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));

        let key = PoolKey::for_agent(&shell_agent());
        assert_eq!(executor.pool().idle_count(&key), 0);
    }

    #[tokio::test]
    async fn test_layer_routes_by_transport() {
        let script = Script::new(&[Behavior::Exit(0)]);
        let http = RemoteExecutor::Http(HttpExecutor::with_connector(
            Arc::new(ScriptedConnector(Script::new(&[]))),
            PoolConfig::default(),
            EventEmitter::disabled(),
        ));
        let layer = ExecutionLayer::with_executors(http, shell_executor(&script), RetryPolicy::immediate());
        let (ctx, _cancel) = context();

        let output = layer
            .dispatch(&shell_agent(), &TaskSpec::new("testing", json!("true")), ctx)
            .await
            .unwrap();
        assert_eq!(output.output, "exit 0");
        assert_eq!(layer.pool_stats(Transport::RemoteShell).opened, 1);
        assert_eq!(layer.pool_stats(Transport::HttpModel).opened, 0);
        assert!(layer.probe(&shell_agent()).await.is_ok());
    }

    #[tokio::test]
    async fn test_saturated_agent_still_answers_health_check() {
        let script = Script::new(&[Behavior::Hang]);
        let executor = RemoteExecutor::Shell(ShellExecutor::with_connector(
            Arc::new(ScriptedConnector(Arc::clone(&script))),
            PoolConfig::default()
                .with_max_per_key(1)
                .with_acquire_timeout(Duration::from_millis(20))
                .with_exhaustion_policy(ExhaustionPolicy::Block),
            EventEmitter::disabled(),
        ));
        let (started_tx, started_rx) = oneshot::channel();
        let (ctx, _cancel) = context();
        let mut ctx = ctx.with_started(started_tx);

        let running = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let task = TaskSpec::new("testing", json!("sleep 600"));
                executor
                    .execute(&shell_agent(), &task, &RetryPolicy::immediate(), &TokioSleeper, &mut ctx)
                    .await
            })
        };
        started_rx.await.unwrap();

        executor.probe(&shell_agent()).await.unwrap();
        let key = PoolKey::for_agent(&shell_agent());
        assert_eq!(executor.pool().in_use(&key), 1);
        assert_eq!(executor.pool().stats().exhausted, 0);
        running.abort();
    }

    #[tokio::test]
    async fn test_forget_agent_closes_idle_connections() {
        let script = Script::new(&[Behavior::Exit(0)]);
        let http = RemoteExecutor::Http(HttpExecutor::with_connector(
            Arc::new(ScriptedConnector(Script::new(&[]))),
            PoolConfig::default(),
            EventEmitter::disabled(),
        ));
        let layer = ExecutionLayer::with_executors(http, shell_executor(&script), RetryPolicy::immediate());
        let (ctx, _cancel) = context();
        layer
            .dispatch(&shell_agent(), &TaskSpec::new("testing", json!("true")), ctx)
            .await
            .unwrap();

        let key = PoolKey::for_agent(&shell_agent());
        let pool = layer.executor(Transport::RemoteShell).pool();
        assert_eq!(pool.idle_count(&key), 1);

        layer.forget_agent(&shell_agent()).await;
        assert_eq!(pool.idle_count(&key), 0);
        assert_eq!(layer.pool_stats(Transport::RemoteShell).evicted, 1);
    }
}
