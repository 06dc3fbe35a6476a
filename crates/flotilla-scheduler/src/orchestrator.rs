//! The orchestrator: the inbound surface tying registry, router, health
//! monitor, wait queue and workflow runs together.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! `.await`. Each dispatch runs in its own spawned task and reports back
//! through [`Inner::finish_dispatch`]. Lock order is state, then registry.

use crate::config::SchedulerConfig;
use crate::health::HealthMonitor;
use crate::queue::WaitQueue;
use crate::registry::{AgentRegistry, Reservation};
use crate::router::Router;
use crate::workflow::WorkflowRun;
use chrono::{DateTime, Utc};
use flotilla_core::agent::{AgentDescriptor, AgentSnapshot};
use flotilla_core::events::{
    AgentDeregisteredPayload, AgentRegisteredPayload, Event, EventEmitter, TaskStateChangedPayload,
    WorkflowCompletedPayload,
};
use flotilla_core::ids::{AgentId, NodeId, RunId, Target, TaskId};
use flotilla_core::ports::{DispatchContext, Prober, TaskDispatcher};
use flotilla_core::task::{
    ExecutionOutput, FailureKind, SaturationPolicy, TaskFailure, TaskSnapshot, TaskSpec, TaskStatus,
};
use flotilla_core::workflow::{WorkflowReport, WorkflowSpec, WorkflowStatus};
use flotilla_core::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Answer to a status query.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusSnapshot {
    Task(TaskSnapshot),
    Workflow(WorkflowReport),
}

struct TaskEntry {
    spec: TaskSpec,
    status: TaskStatus,
    agent: Option<AgentId>,
    run: Option<(RunId, NodeId)>,
    output: Option<ExecutionOutput>,
    failure: Option<TaskFailure>,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Present while a dispatch is in flight.
    cancel: Option<watch::Sender<bool>>,
    cancel_requested: bool,
}

impl TaskEntry {
    fn new(spec: TaskSpec, run: Option<(RunId, NodeId)>) -> Self {
        let now = Utc::now();
        Self {
            spec,
            status: TaskStatus::Pending,
            agent: None,
            run,
            output: None,
            failure: None,
            submitted_at: now,
            updated_at: now,
            cancel: None,
            cancel_requested: false,
        }
    }

    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            spec: self.spec.clone(),
            status: self.status,
            agent: self.agent.clone(),
            run: self.run.clone(),
            output: self.output.clone(),
            failure: self.failure.clone(),
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskEntry>,
    runs: HashMap<RunId, WorkflowRun>,
    queue: WaitQueue,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthMonitor>,
    router: Router,
    dispatcher: Arc<dyn TaskDispatcher>,
    prober: Arc<dyn Prober>,
    events: EventEmitter,
    state: Mutex<State>,
    /// Bumped on every terminal task or run transition.
    settled: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Routes tasks to agents, tracks their lifecycle and drives workflow runs.
///
/// Cheap to clone. Submission and cancellation spawn Tokio tasks and must be
/// called from within a runtime.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: SchedulerConfig,
        dispatcher: Arc<dyn TaskDispatcher>,
        prober: Arc<dyn Prober>,
        events: EventEmitter,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::new());
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            config.health.clone(),
            events.clone(),
        ));
        let router = Router::new(Arc::clone(&registry), config.router.clone());
        let (settled, _) = watch::channel(0);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                health,
                router,
                dispatcher,
                prober,
                events,
                state: Mutex::new(State::default()),
                settled,
                shutdown_tx,
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start health probing and the wait-queue ticker. Idempotent.
    pub fn start(&self) {
        let mut background = lock(&self.inner.background);
        if !background.is_empty() {
            return;
        }

        let health = Arc::clone(&self.inner.health);
        let prober = Arc::clone(&self.inner.prober);
        background.push(tokio::spawn(
            health.run(prober, self.inner.shutdown_tx.subscribe()),
        ));
        background.push(tokio::spawn(queue_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.queue_poll_interval(),
            self.inner.shutdown_tx.subscribe(),
        )));
        info!("Orchestrator started");
    }

    /// Stop background loops and cancel every unfinished task and run.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        let _ = self.inner.shutdown_tx.send(true);
        {
            let mut state = self.inner.lock();
            let runs: Vec<RunId> = state.runs.keys().copied().collect();
            for run_id in runs {
                self.inner.cancel_run(&mut state, run_id);
            }
            let tasks: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|(_, t)| !t.status.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for task_id in tasks {
                self.inner.cancel_task(&mut state, task_id);
            }
        }

        let handles = std::mem::take(&mut *lock(&self.inner.background));
        for handle in handles {
            let _ = handle.await;
        }
    }

    // === Agents ===

    pub fn register_agent(&self, descriptor: AgentDescriptor) -> Result<()> {
        self.inner.registry.register(descriptor.clone())?;
        self.inner
            .events
            .emit(Event::AgentRegistered(AgentRegisteredPayload {
                agent_id: descriptor.id,
                transport: descriptor.transport,
                capabilities: descriptor.capabilities,
                max_concurrent: descriptor.max_concurrent,
                timestamp: Utc::now(),
            }));

        let mut state = self.inner.lock();
        self.inner.drain_queue(&mut state);
        Ok(())
    }

    /// Remove an agent. With `force`, its in-flight tasks are failed with
    /// "agent removed" and signalled to stop; their ids are returned.
    ///
    /// Pooled connections to the agent are closed in the background.
    pub fn deregister_agent(&self, id: &AgentId, force: bool) -> Result<Vec<TaskId>> {
        let mut state = self.inner.lock();
        let descriptor = self.inner.registry.get(id).map(|s| s.descriptor);
        let drained = self.inner.registry.deregister(id, force)?;
        let failed: Vec<TaskId> = drained.into_iter().map(|(_, task_id)| task_id).collect();

        for task_id in &failed {
            if let Some(entry) = state.tasks.get_mut(task_id)
                && let Some(cancel) = &entry.cancel
            {
                let _ = cancel.send(true);
            }
            self.inner.transition(
                &mut state,
                *task_id,
                TaskStatus::Failed,
                Some(TaskFailure::agent_removed()),
            );
        }

        self.inner.health.forget(id);
        if let Some(descriptor) = descriptor {
            let dispatcher = Arc::clone(&self.inner.dispatcher);
            tokio::spawn(async move { dispatcher.forget_agent(&descriptor).await });
        }
        self.inner
            .events
            .emit(Event::AgentDeregistered(AgentDeregisteredPayload {
                agent_id: id.clone(),
                failed_tasks: failed.clone(),
                timestamp: Utc::now(),
            }));

        // Queued work may have lost its last capable agent.
        self.inner.drain_queue(&mut state);
        Ok(failed)
    }

    pub fn agents(&self) -> Vec<AgentSnapshot> {
        self.inner.registry.snapshot()
    }

    /// Probe every agent once, outside the regular interval.
    pub async fn probe_now(&self) {
        self.inner
            .health
            .probe_all(self.inner.prober.as_ref())
            .await;
    }

    // === Tasks and workflows ===

    /// Submit a standalone task.
    ///
    /// Routing errors surface immediately unless the task opted into queuing,
    /// in which case it waits in `pending` for capacity.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let task_id = TaskId::new();
        let mut state = self.inner.lock();
        self.inner.admit(&mut state, task_id, spec, None)?;
        Ok(task_id)
    }

    /// Validate and start a workflow run.
    pub fn submit_workflow(&self, spec: WorkflowSpec) -> Result<RunId> {
        let run_id = RunId::new();
        let mut run = WorkflowRun::new(run_id, &spec)?;
        let roots = run.start();

        info!(
            run_id = %run_id,
            workflow = %spec.name,
            nodes = spec.nodes.len(),
            "Workflow submitted"
        );

        let mut state = self.inner.lock();
        state.runs.insert(run_id, run);
        for node in roots {
            self.inner.submit_node(&mut state, run_id, node);
        }
        self.inner.finish_run_if_settled(&mut state, run_id);
        Ok(run_id)
    }

    /// Cancel a task or a whole run. Cancelling something already terminal is a no-op.
    pub fn cancel(&self, target: Target) -> Result<()> {
        let mut state = self.inner.lock();
        match target {
            Target::Task(task_id) => {
                if !state.tasks.contains_key(&task_id) {
                    return Err(Error::TaskNotFound(task_id.to_string()));
                }
                self.inner.cancel_task(&mut state, task_id);
            }
            Target::Run(run_id) => {
                if !state.runs.contains_key(&run_id) {
                    return Err(Error::RunNotFound(run_id.to_string()));
                }
                self.inner.cancel_run(&mut state, run_id);
            }
        }
        Ok(())
    }

    pub fn task_status(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .map(|entry| entry.snapshot(id))
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn workflow_status(&self, id: RunId) -> Result<WorkflowReport> {
        self.inner
            .lock()
            .runs
            .get(&id)
            .map(WorkflowRun::report)
            .ok_or_else(|| Error::RunNotFound(id.to_string()))
    }

    pub fn status(&self, target: Target) -> Result<StatusSnapshot> {
        match target {
            Target::Task(id) => self.task_status(id).map(StatusSnapshot::Task),
            Target::Run(id) => self.workflow_status(id).map(StatusSnapshot::Workflow),
        }
    }

    /// Number of tasks waiting for capacity.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Resolve once the task reaches a terminal state.
    pub async fn wait_for_task(&self, id: TaskId) -> Result<TaskSnapshot> {
        let mut settled = self.inner.settled.subscribe();
        loop {
            let snapshot = self.task_status(id)?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            settled
                .changed()
                .await
                .map_err(|_| Error::Internal("orchestrator stopped".to_string()))?;
        }
    }

    /// Resolve once the run has settled in a terminal state.
    pub async fn wait_for_workflow(&self, id: RunId) -> Result<WorkflowReport> {
        let mut settled = self.inner.settled.subscribe();
        loop {
            let report = self.workflow_status(id)?;
            if report.completed_at.is_some() {
                return Ok(report);
            }
            settled
                .changed()
                .await
                .map_err(|_| Error::Internal("orchestrator stopped".to_string()))?;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Re-examine the wait queue on a fixed interval so time-based fallback fires
/// even when no dispatch settles.
async fn queue_loop(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let mut state = inner.lock();
                inner.drain_queue(&mut state);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Queue ticker shutting down");
                    break;
                }
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn bump_settled(&self) {
        self.settled.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Whether a task may route to fallback agents after waiting `waited`.
    fn fallback_open(&self, spec: &TaskSpec, waited: Duration) -> bool {
        spec.on_saturation == SaturationPolicy::Reject
            || self
                .router
                .preferred_wait(&spec.capability)
                .is_none_or(|max_wait| waited >= max_wait)
    }

    /// Whether a routing error should leave the task waiting in the queue.
    fn should_wait(&self, spec: &TaskSpec, err: &Error) -> bool {
        if spec.on_saturation != SaturationPolicy::Queue {
            return false;
        }
        match err {
            Error::NoCapacity { .. } => true,
            // Capable agents exist but are excluded for now, e.g. unhealthy.
            Error::NoCapableAgent { .. } => self
                .registry
                .has_capable(&spec.capability, &spec.constraints),
            _ => false,
        }
    }

    /// Route a new task and record it. Standalone tasks that can neither be
    /// placed nor queued are rejected without a record.
    fn admit(
        self: &Arc<Self>,
        state: &mut State,
        task_id: TaskId,
        spec: TaskSpec,
        run: Option<(RunId, NodeId)>,
    ) -> Result<()> {
        let routed = self
            .router
            .route(task_id, &spec, self.fallback_open(&spec, Duration::ZERO));
        if let Err(e) = &routed
            && run.is_none()
            && !self.should_wait(&spec, e)
        {
            debug!(task_id = %task_id, capability = %spec.capability, error = %e, "Task rejected");
            return Err(e.clone());
        }

        let priority = spec.priority;
        let queue_it = routed
            .as_ref()
            .err()
            .is_some_and(|e| self.should_wait(&spec, e));

        info!(
            task_id = %task_id,
            capability = %spec.capability,
            priority,
            "Task submitted"
        );
        state.tasks.insert(task_id, TaskEntry::new(spec, run));
        self.emit_task_event(state, task_id, None);

        match routed {
            Ok(reservation) => self.start_dispatch(state, reservation),
            Err(_) if queue_it => {
                debug!(task_id = %task_id, "Task queued for capacity");
                state.queue.enqueue(task_id, priority);
            }
            Err(e) => {
                self.transition(state, task_id, TaskStatus::Failed, Some(TaskFailure::from(&e)));
            }
        }
        Ok(())
    }

    fn submit_node(self: &Arc<Self>, state: &mut State, run_id: RunId, node: NodeId) {
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        if run.status() != WorkflowStatus::Running {
            return;
        }
        let Some(spec) = run.spec(&node).cloned() else {
            return;
        };

        let task_id = TaskId::new();
        run.mark_submitted(&node, task_id);
        debug!(run_id = %run_id, node = %node, task_id = %task_id, "Submitting workflow node");

        // Workflow nodes always wait for capacity; only errors that leave no
        // capable agent at all fail the node.
        if let Err(e) = self.admit(state, task_id, spec.queued(), Some((run_id, node))) {
            warn!(run_id = %run_id, task_id = %task_id, error = %e, "Workflow node rejected");
        }
    }

    fn start_dispatch(self: &Arc<Self>, state: &mut State, reservation: Reservation) {
        let task_id = reservation.task_id;
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            self.router.release(&reservation);
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel();
        entry.agent = Some(reservation.agent.id.clone());
        entry.cancel = Some(cancel_tx);
        let spec = entry.spec.clone();

        self.transition(state, task_id, TaskStatus::Dispatched, None);

        let ctx = DispatchContext::new(task_id, cancel_rx).with_started(started_tx);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_dispatch(reservation, spec, ctx, started_rx).await;
        });
    }

    async fn run_dispatch(
        self: Arc<Self>,
        reservation: Reservation,
        spec: TaskSpec,
        ctx: DispatchContext,
        mut started: oneshot::Receiver<u32>,
    ) {
        let task_id = reservation.task_id;
        let result = {
            let dispatch = self.dispatcher.dispatch(&reservation.agent, &spec, ctx);
            tokio::pin!(dispatch);

            let mut started_seen = false;
            loop {
                tokio::select! {
                    biased;
                    attempt = &mut started, if !started_seen => {
                        started_seen = true;
                        if let Ok(attempt) = attempt {
                            self.mark_running(task_id, attempt);
                        }
                    }
                    result = &mut dispatch => break result,
                }
            }
        };

        self.finish_dispatch(reservation, result);
    }

    fn mark_running(self: &Arc<Self>, task_id: TaskId, attempt: u32) {
        let mut state = self.lock();
        if state
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Dispatched)
        {
            debug!(task_id = %task_id, attempt, "Agent accepted task");
            self.transition(&mut state, task_id, TaskStatus::Running, None);
        }
    }

    fn finish_dispatch(self: &Arc<Self>, reservation: Reservation, result: Result<ExecutionOutput>) {
        let task_id = reservation.task_id;
        let agent_id = reservation.agent.id.clone();
        self.router.release(&reservation);

        match &result {
            Ok(_) => self.health.record_success(&agent_id),
            Err(e) if e.is_transient() => self.health.record_failure(&agent_id, e.to_string()),
            Err(_) => {}
        }

        let mut state = self.lock();
        self.settle_task(&mut state, task_id, result);
        self.drain_queue(&mut state);
    }

    fn settle_task(self: &Arc<Self>, state: &mut State, task_id: TaskId, result: Result<ExecutionOutput>) {
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        entry.cancel = None;
        if entry.status.is_terminal() {
            debug!(task_id = %task_id, status = %entry.status, "Discarding result of settled task");
            return;
        }
        if entry.cancel_requested {
            self.transition(state, task_id, TaskStatus::Cancelled, None);
            return;
        }

        match result {
            Ok(output) if output.status.is_success() => {
                entry.output = Some(output);
                if entry.status == TaskStatus::Dispatched {
                    self.transition(state, task_id, TaskStatus::Running, None);
                }
                self.transition(state, task_id, TaskStatus::Completed, None);
            }
            Ok(output) => {
                let failure = TaskFailure {
                    kind: FailureKind::RemoteFailure,
                    attempt: Some(output.attempts),
                    message: format!("agent reported {}", output.status),
                };
                entry.output = Some(output);
                self.transition(state, task_id, TaskStatus::Failed, Some(failure));
            }
            Err(Error::Cancelled { .. }) => {
                self.transition(state, task_id, TaskStatus::Cancelled, None);
            }
            Err(e) => {
                self.transition(state, task_id, TaskStatus::Failed, Some(TaskFailure::from(&e)));
            }
        }
    }

    /// Try to place every queued task, most urgent first.
    fn drain_queue(self: &Arc<Self>, state: &mut State) {
        if state.queue.is_empty() {
            return;
        }

        for queued in state.queue.take_all() {
            let Some(entry) = state.tasks.get(&queued.task_id) else {
                continue;
            };
            if entry.status != TaskStatus::Pending {
                continue;
            }
            let spec = entry.spec.clone();
            let include_fallback = self.fallback_open(&spec, queued.queued_at.elapsed());

            match self.router.route(queued.task_id, &spec, include_fallback) {
                Ok(reservation) => self.start_dispatch(state, reservation),
                Err(e) if self.should_wait(&spec, &e) => state.queue.requeue(queued),
                Err(e) => {
                    self.transition(state, queued.task_id, TaskStatus::Failed, Some(TaskFailure::from(&e)));
                }
            }
        }
    }

    fn cancel_task(self: &Arc<Self>, state: &mut State, task_id: TaskId) {
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        match entry.status {
            TaskStatus::Pending => {
                state.queue.remove(task_id);
                self.transition(state, task_id, TaskStatus::Cancelled, None);
            }
            TaskStatus::Dispatched | TaskStatus::Running => {
                // The status follows once the dispatch settles.
                entry.cancel_requested = true;
                if let Some(cancel) = &entry.cancel {
                    let _ = cancel.send(true);
                }
                info!(task_id = %task_id, "Cancellation requested");
            }
            _ => {}
        }
    }

    fn cancel_run(self: &Arc<Self>, state: &mut State, run_id: RunId) {
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        if run.is_finished() {
            return;
        }
        let tasks = run.cancel();
        info!(run_id = %run_id, in_flight = tasks.len(), "Cancelling workflow run");
        for task_id in tasks {
            self.cancel_task(state, task_id);
        }
        self.finish_run_if_settled(state, run_id);
    }

    /// Apply a lifecycle step, emit its event and advance the owning run.
    fn transition(
        self: &Arc<Self>,
        state: &mut State,
        task_id: TaskId,
        next: TaskStatus,
        failure: Option<TaskFailure>,
    ) {
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let old = entry.status;
        if !old.can_transition_to(next) {
            debug!(task_id = %task_id, from = %old, to = %next, "Ignoring illegal transition");
            return;
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        if failure.is_some() {
            entry.failure = failure.clone();
        }
        let run = entry.run.clone();

        match (next, &failure) {
            (TaskStatus::Failed, Some(f)) => warn!(
                task_id = %task_id,
                kind = ?f.kind,
                attempt = f.attempt,
                error = %f.message,
                "Task failed"
            ),
            (TaskStatus::Completed | TaskStatus::Cancelled, _) => {
                info!(task_id = %task_id, status = %next, "Task finished")
            }
            _ => debug!(task_id = %task_id, from = %old, to = %next, "Task state changed"),
        }

        self.emit_task_event(state, task_id, Some(old));
        if next.is_terminal() {
            self.bump_settled();
        }

        if let Some((run_id, node)) = run {
            self.advance_run(state, run_id, &node, next, failure);
        }
    }

    fn emit_task_event(&self, state: &State, task_id: TaskId, old_status: Option<TaskStatus>) {
        let Some(entry) = state.tasks.get(&task_id) else {
            return;
        };
        self.events
            .emit(Event::TaskStateChanged(TaskStateChangedPayload {
                task_id,
                run_id: entry.run.as_ref().map(|(run_id, _)| *run_id),
                node_id: entry.run.as_ref().map(|(_, node)| node.clone()),
                agent_id: entry.agent.clone(),
                old_status,
                new_status: entry.status,
                error: entry.failure.clone(),
                timestamp: entry.updated_at,
            }));
    }

    fn advance_run(
        self: &Arc<Self>,
        state: &mut State,
        run_id: RunId,
        node: &NodeId,
        status: TaskStatus,
        failure: Option<TaskFailure>,
    ) {
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        match status {
            TaskStatus::Completed => {
                let ready = run.on_node_completed(node);
                for next in ready {
                    self.submit_node(state, run_id, next);
                }
            }
            TaskStatus::Failed => {
                let failure = failure.unwrap_or_else(|| TaskFailure::new(FailureKind::Internal, "failed"));
                let skipped = run.on_node_failed(node, failure);
                if !skipped.is_empty() {
                    info!(
                        run_id = %run_id,
                        node = %node,
                        skipped = skipped.len(),
                        "Failing downstream nodes"
                    );
                }

                // Siblings still waiting in the queue never start once the run has failed.
                let queued: Vec<TaskId> = state
                    .tasks
                    .iter()
                    .filter(|(_, e)| e.status == TaskStatus::Pending)
                    .filter(|(_, e)| e.run.as_ref().is_some_and(|(id, _)| *id == run_id))
                    .map(|(task_id, _)| *task_id)
                    .collect();
                if !queued.is_empty() {
                    info!(run_id = %run_id, cancelled = queued.len(), "Cancelling queued nodes of failed run");
                }
                for task_id in queued {
                    self.cancel_task(state, task_id);
                }
            }
            TaskStatus::Cancelled => run.on_node_cancelled(node),
            other => run.set_node_status(node, other),
        }
        self.finish_run_if_settled(state, run_id);
    }

    fn finish_run_if_settled(&self, state: &mut State, run_id: RunId) {
        let Some(run) = state.runs.get_mut(&run_id) else {
            return;
        };
        let Some(status) = run.try_finish() else {
            return;
        };

        let report = run.report();
        match status {
            WorkflowStatus::Completed => info!(run_id = %run_id, workflow = %report.name, "Workflow completed"),
            _ => warn!(
                run_id = %run_id,
                workflow = %report.name,
                status = %status,
                failed = report.failed_nodes.len(),
                skipped = report.skipped_nodes.len(),
                cancelled = report.cancelled_nodes.len(),
                "Workflow finished"
            ),
        }
        self.events
            .emit(Event::WorkflowCompleted(WorkflowCompletedPayload {
                run_id,
                name: report.name,
                status,
                failed_nodes: report.failed_nodes,
                skipped_nodes: report.skipped_nodes,
                cancelled_nodes: report.cancelled_nodes,
                timestamp: Utc::now(),
            }));
        self.bump_settled();
    }
}
