//! Worker Pool Manager: supervises the worker processes, owns the bounded
//! job queue, and enforces deadlines and memory ceilings.
//!
//! The manager is a single task owning all slot state; nothing else touches
//! the queue or the slots. The submit channel's capacity *is* the bounded
//! FIFO queue: `submit` suspends when it is full (backpressure, never a
//! silent drop), and the manager only receives from it while an idle slot
//! exists, so jobs are assigned immediately whenever a worker is free.

use crate::error::PoolError;
use crate::pool::protocol::{
    DatasetSchema, ExecutionResult, TableProfile, WorkerReply, WorkerRequest,
};
use crate::pool::slot::{SlotEvent, SlotId, SlotState, WorkerSlot};
use crate::pool::spawn::WorkerSpawner;
use crate::{ConversationId, DatasetRef, JobId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Deadline sweep cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

/// One query execution request submitted to the pool.
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub id: JobId,
    pub conversation_id: Option<ConversationId>,
    pub payload: JobPayload,
    /// Per-job deadline; zero falls back to the pool's configured default.
    pub timeout_ms: u64,
}

impl QueryJob {
    pub fn query(
        conversation_id: Option<ConversationId>,
        query_text: impl Into<String>,
        dataset_refs: Vec<DatasetRef>,
        page: u32,
        page_size: u32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            conversation_id,
            payload: JobPayload::Query {
                query_text: query_text.into(),
                dataset_refs,
                page,
                page_size,
            },
            timeout_ms,
        }
    }

    pub fn schema(dataset: DatasetRef) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            conversation_id: None,
            payload: JobPayload::Schema { dataset },
            timeout_ms: 0,
        }
    }

    pub fn profile(dataset: DatasetRef, table: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            conversation_id: None,
            payload: JobPayload::Profile {
                dataset,
                table: table.into(),
            },
            timeout_ms: 0,
        }
    }

    fn to_request(&self) -> WorkerRequest {
        match &self.payload {
            JobPayload::Query {
                query_text,
                dataset_refs,
                page,
                page_size,
            } => WorkerRequest::Query {
                job_id: self.id,
                query_text: query_text.clone(),
                dataset_refs: dataset_refs.clone(),
                page: *page,
                page_size: *page_size,
            },
            JobPayload::Schema { dataset } => WorkerRequest::Schema {
                job_id: self.id,
                dataset: dataset.clone(),
            },
            JobPayload::Profile { dataset, table } => WorkerRequest::Profile {
                job_id: self.id,
                dataset: dataset.clone(),
                table: table.clone(),
            },
        }
    }
}

/// What a job asks the worker to do.
#[derive(Debug, Clone)]
pub enum JobPayload {
    Query {
        query_text: String,
        dataset_refs: Vec<DatasetRef>,
        page: u32,
        page_size: u32,
    },
    Schema {
        dataset: DatasetRef,
    },
    Profile {
        dataset: DatasetRef,
        table: String,
    },
}

/// Successful job outcome, mirroring the request kind.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Result(ExecutionResult),
    Schema(DatasetSchema),
    Profile(TableProfile),
}

/// Point-in-time pool health for operators and tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolHealth {
    pub pool_size: usize,
    pub live_workers: usize,
    pub busy_workers: usize,
    pub queue_depth: usize,
    pub jobs_executed: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub memory_retirements: u64,
    pub slots: Vec<SlotHealth>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotHealth {
    pub id: SlotId,
    pub state: SlotState,
    pub pid: Option<u32>,
    pub memory_mb: u64,
    pub current_job: Option<JobId>,
}

/// Cloneable handle for submitting jobs and controlling the pool.
#[derive(Clone)]
pub struct PoolHandle {
    job_tx: mpsc::Sender<SubmittedJob>,
    control_tx: mpsc::Sender<Control>,
    queue_capacity: usize,
}

impl PoolHandle {
    /// Submit a job and await its outcome. Suspends while the queue is full;
    /// callers that need a bound on the wait apply their own timeout around
    /// this future. The returned ticket resolves exactly once.
    pub async fn submit(&self, job: QueryJob) -> Result<JobOutcome, PoolError> {
        let (ticket, resolution) = oneshot::channel();
        let submitted = SubmittedJob {
            job,
            ticket,
            requeues: 0,
        };
        self.job_tx
            .send(submitted)
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        resolution.await.map_err(|_| PoolError::ShuttingDown)?
    }

    /// Submit a SQL query job.
    pub async fn execute_query(
        &self,
        conversation_id: Option<ConversationId>,
        query_text: impl Into<String>,
        dataset_refs: Vec<DatasetRef>,
        page: u32,
        page_size: u32,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, PoolError> {
        let job = QueryJob::query(
            conversation_id,
            query_text,
            dataset_refs,
            page,
            page_size,
            timeout_ms,
        );
        match self.submit(job).await? {
            JobOutcome::Result(result) => Ok(result),
            // Workers answer a query op with a result op; anything else is a
            // protocol bug caught in development.
            other => unreachable!("query job answered with {other:?}"),
        }
    }

    /// Fetch a dataset's schema through the pool.
    pub async fn schema(&self, dataset: DatasetRef) -> Result<JobOutcome, PoolError> {
        self.submit(QueryJob::schema(dataset)).await
    }

    /// Profile one table through the pool.
    pub async fn profile(
        &self,
        dataset: DatasetRef,
        table: impl Into<String>,
    ) -> Result<JobOutcome, PoolError> {
        self.submit(QueryJob::profile(dataset, table)).await
    }

    /// Snapshot pool health. Queue depth is derived from the submit channel's
    /// remaining capacity.
    pub async fn health(&self) -> Result<PoolHealth, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Health(tx))
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        let mut health = rx.await.map_err(|_| PoolError::ShuttingDown)?;
        health.queue_depth = self.queue_capacity.saturating_sub(self.job_tx.capacity());
        Ok(health)
    }

    /// Stop intake, let in-flight jobs finish up to `grace`, then force-kill
    /// remaining workers.
    pub async fn shutdown(&self, grace: Duration) {
        let (tx, rx) = oneshot::channel();
        if self
            .control_tx
            .send(Control::Shutdown { grace, ack: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// The worker pool. `start` spawns the workers and the manager task exactly
/// once and hands back the only way to reach them; restarting a pool means
/// starting a new one.
pub struct WorkerPool;

impl WorkerPool {
    pub async fn start(
        config: crate::config::PoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<PoolHandle, PoolError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Fail fast if the initial fleet cannot come up.
        let mut slots = Vec::with_capacity(config.pool_size);
        for id in 0..config.pool_size {
            match WorkerSlot::spawn(spawner.as_ref(), id, 0, event_tx.clone()).await {
                Ok(slot) => slots.push(SlotEntry {
                    slot,
                    running: None,
                }),
                Err(err) => {
                    for entry in &mut slots {
                        entry.slot.kill().await;
                    }
                    return Err(err);
                }
            }
        }

        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(8);
        let queue_capacity = config.queue_capacity;

        let manager = Manager {
            config,
            spawner,
            slots,
            requeue: VecDeque::new(),
            event_tx,
            system: sysinfo::System::new(),
            counters: Counters::default(),
            shutdown: None,
        };
        tokio::spawn(manager.run(job_rx, control_rx, event_rx));

        Ok(PoolHandle {
            job_tx,
            control_tx,
            queue_capacity,
        })
    }
}

enum Control {
    Shutdown {
        grace: Duration,
        ack: oneshot::Sender<()>,
    },
    Health(oneshot::Sender<PoolHealth>),
}

struct SubmittedJob {
    job: QueryJob,
    ticket: oneshot::Sender<Result<JobOutcome, PoolError>>,
    requeues: u32,
}

struct RunningJob {
    submitted: SubmittedJob,
    deadline: Instant,
}

struct SlotEntry {
    slot: WorkerSlot,
    running: Option<RunningJob>,
}

#[derive(Default)]
struct Counters {
    jobs_executed: u64,
    timeouts: u64,
    crashes: u64,
    memory_retirements: u64,
}

struct ShutdownState {
    deadline: Instant,
    ack: Option<oneshot::Sender<()>>,
}

struct Manager {
    config: crate::config::PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    slots: Vec<SlotEntry>,
    /// Crash-requeued jobs; served before fresh intake.
    requeue: VecDeque<SubmittedJob>,
    event_tx: mpsc::UnboundedSender<SlotEvent>,
    system: sysinfo::System,
    counters: Counters,
    shutdown: Option<ShutdownState>,
}

impl Manager {
    async fn run(
        mut self,
        mut job_rx: mpsc::Receiver<SubmittedJob>,
        mut control_rx: mpsc::Receiver<Control>,
        mut event_rx: mpsc::UnboundedReceiver<SlotEvent>,
    ) {
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut control_closed = false;

        loop {
            // Requeued jobs go out first, then fresh intake resumes.
            while self.idle_slot().is_some() && !self.requeue.is_empty() {
                if let Some(job) = self.requeue.pop_front() {
                    self.dispatch(job).await;
                }
            }

            let can_take_new =
                self.shutdown.is_none() && self.requeue.is_empty() && self.idle_slot().is_some();

            tokio::select! {
                biased;
                maybe_control = control_rx.recv(), if !control_closed => match maybe_control {
                    Some(Control::Shutdown { grace, ack }) => {
                        self.begin_shutdown(grace, Some(ack), &mut job_rx);
                    }
                    Some(Control::Health(reply)) => {
                        let _ = reply.send(self.health());
                    }
                    None => {
                        control_closed = true;
                        self.begin_shutdown(
                            Duration::from_millis(self.config.shutdown_grace_ms),
                            None,
                            &mut job_rx,
                        );
                    }
                },
                Some(event) = event_rx.recv() => self.handle_slot_event(event).await,
                _ = watchdog.tick() => self.sweep(&mut job_rx).await,
                Some(job) = job_rx.recv(), if can_take_new => self.dispatch(job).await,
            }

            if self.shutdown.is_some() && self.in_flight() == 0 {
                break;
            }
        }

        self.finalize_shutdown().await;
    }

    fn idle_slot(&self) -> Option<SlotId> {
        // Lowest idle slot id; deterministic assignment for tests.
        self.slots
            .iter()
            .find(|entry| entry.slot.state == SlotState::Idle)
            .map(|entry| entry.slot.id)
    }

    fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.running.is_some())
            .count()
    }

    async fn dispatch(&mut self, submitted: SubmittedJob) {
        let Some(slot_id) = self.idle_slot() else {
            // No idle slot (the one we saw crashed in the meantime); put the
            // job back at the front so ordering is preserved.
            self.requeue.push_front(submitted);
            return;
        };

        let timeout_ms = if submitted.job.timeout_ms > 0 {
            submitted.job.timeout_ms
        } else {
            self.config.query_timeout_ms
        };

        let request = submitted.job.to_request();
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(job_id = %submitted.job.id, error = %err, "unencodable job");
                let _ = submitted
                    .ticket
                    .send(Err(PoolError::SpawnFailed(err.to_string())));
                return;
            }
        };

        let entry = &mut self.slots[slot_id];
        if let Err(err) = entry.slot.send(&payload).await {
            // The worker died between going idle and this dispatch. Treat it
            // like a crash: replace the process and requeue under the same
            // policy.
            tracing::warn!(
                slot_id,
                job_id = %submitted.job.id,
                error = %err,
                "dispatch to dead worker"
            );
            entry.slot.kill().await;
            entry.slot.state = SlotState::Crashed;
            self.counters.crashes += 1;
            self.requeue_or_fail(submitted);
            self.respawn(slot_id).await;
            return;
        }

        let entry = &mut self.slots[slot_id];
        entry.slot.state = SlotState::Busy;
        entry.slot.current_job = Some(submitted.job.id);
        tracing::debug!(
            slot_id,
            job_id = %submitted.job.id,
            timeout_ms,
            "job running"
        );
        entry.running = Some(RunningJob {
            submitted,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
        });
    }

    async fn handle_slot_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Reply {
                slot_id,
                generation,
                reply,
            } => {
                let entry = &mut self.slots[slot_id];
                if entry.slot.generation != generation {
                    // A reply from a process we already killed.
                    return;
                }
                let Some(running) = entry.running.take() else {
                    tracing::warn!(slot_id, "unsolicited worker reply");
                    return;
                };
                if reply.job_id() != running.submitted.job.id {
                    // Protocol violation: the worker answered a job it was
                    // not given. Retire it and fail the in-flight job.
                    tracing::warn!(
                        slot_id,
                        expected = %running.submitted.job.id,
                        got = %reply.job_id(),
                        "reply for wrong job, retiring worker"
                    );
                    let _ = running.submitted.ticket.send(Err(PoolError::WorkerCrash));
                    let entry = &mut self.slots[slot_id];
                    entry.slot.current_job = None;
                    entry.slot.kill().await;
                    entry.slot.state = SlotState::Crashed;
                    if self.shutdown.is_none() {
                        self.respawn(slot_id).await;
                    }
                    return;
                }

                let outcome = match reply {
                    WorkerReply::Result { result, .. } => JobOutcome::Result(result),
                    WorkerReply::Schema { schema, .. } => JobOutcome::Schema(schema),
                    WorkerReply::Profile { profile, .. } => JobOutcome::Profile(profile),
                };
                self.counters.jobs_executed += 1;
                tracing::debug!(slot_id, job_id = %running.submitted.job.id, "job succeeded");
                let _ = running.submitted.ticket.send(Ok(outcome));

                let entry = &mut self.slots[slot_id];
                entry.slot.current_job = None;

                // Memory ceiling: the job's result is already delivered; the
                // worker is retired proactively if it grew past the limit.
                let rss_mb = entry.slot.sample_memory_mb(&mut self.system);
                if rss_mb > self.config.memory_limit_mb {
                    self.counters.memory_retirements += 1;
                    tracing::warn!(
                        slot_id,
                        rss_mb,
                        limit_mb = self.config.memory_limit_mb,
                        "worker over memory ceiling, retiring"
                    );
                    entry.slot.kill().await;
                    entry.slot.state = SlotState::Crashed;
                    if self.shutdown.is_none() {
                        self.respawn(slot_id).await;
                    }
                } else {
                    entry.slot.state = SlotState::Idle;
                }
            }
            SlotEvent::Exited {
                slot_id,
                generation,
            } => {
                let entry = &mut self.slots[slot_id];
                if entry.slot.generation != generation {
                    // We killed this process ourselves (timeout/retirement);
                    // its replacement is already up.
                    return;
                }
                entry.slot.reap().await;
                entry.slot.state = SlotState::Crashed;
                entry.slot.current_job = None;

                if let Some(running) = entry.running.take() {
                    self.counters.crashes += 1;
                    tracing::warn!(
                        slot_id,
                        job_id = %running.submitted.job.id,
                        "worker crashed mid-job"
                    );
                    self.requeue_or_fail(running.submitted);
                } else if self.shutdown.is_none() {
                    self.counters.crashes += 1;
                    tracing::warn!(slot_id, "idle worker exited unexpectedly");
                }

                if self.shutdown.is_none() {
                    self.respawn(slot_id).await;
                }
            }
        }
    }

    /// Requeue a crashed-out job once; surface the crash on the next one.
    /// The replacement process is necessarily a different worker, so the
    /// requeued attempt never lands on the process that failed it.
    fn requeue_or_fail(&mut self, mut submitted: SubmittedJob) {
        if submitted.requeues < self.config.max_crash_requeues {
            submitted.requeues += 1;
            tracing::info!(
                job_id = %submitted.job.id,
                attempt = submitted.requeues + 1,
                "requeueing crashed job"
            );
            self.requeue.push_front(submitted);
        } else {
            let _ = submitted.ticket.send(Err(PoolError::WorkerCrash));
        }
    }

    async fn respawn(&mut self, slot_id: SlotId) {
        let generation = self.slots[slot_id].slot.generation + 1;
        self.slots[slot_id].slot.state = SlotState::Restarting;
        match WorkerSlot::spawn(
            self.spawner.as_ref(),
            slot_id,
            generation,
            self.event_tx.clone(),
        )
        .await
        {
            Ok(slot) => {
                self.slots[slot_id].slot = slot;
            }
            Err(err) => {
                // Leave the slot crashed; the sweep keeps retrying so the
                // pool converges back to full size.
                tracing::error!(slot_id, error = %err, "worker respawn failed");
                self.slots[slot_id].slot.state = SlotState::Crashed;
            }
        }
    }

    async fn sweep(&mut self, job_rx: &mut mpsc::Receiver<SubmittedJob>) {
        let now = Instant::now();

        // Deadline enforcement: cancellation is killing the process.
        for slot_id in 0..self.slots.len() {
            let expired = self.slots[slot_id]
                .running
                .as_ref()
                .is_some_and(|running| running.deadline <= now);
            if !expired {
                continue;
            }
            let Some(running) = self.slots[slot_id].running.take() else {
                continue;
            };
            let timeout_ms = if running.submitted.job.timeout_ms > 0 {
                running.submitted.job.timeout_ms
            } else {
                self.config.query_timeout_ms
            };
            self.counters.timeouts += 1;
            tracing::warn!(
                slot_id,
                job_id = %running.submitted.job.id,
                timeout_ms,
                "job timed out, killing worker"
            );
            let _ = running
                .submitted
                .ticket
                .send(Err(PoolError::QueryTimeout { timeout_ms }));
            self.slots[slot_id].slot.current_job = None;
            self.slots[slot_id].slot.kill().await;
            self.slots[slot_id].slot.state = SlotState::Crashed;
            if self.shutdown.is_none() {
                self.respawn(slot_id).await;
            }
        }

        // Pool repair: keep retrying slots whose respawn failed.
        for slot_id in 0..self.slots.len() {
            if self.slots[slot_id].slot.state == SlotState::Crashed && self.shutdown.is_none() {
                self.respawn(slot_id).await;
            }
        }

        // Shutdown grace: past the deadline, in-flight jobs are abandoned.
        if let Some(shutdown) = &self.shutdown
            && shutdown.deadline <= now
        {
            for entry in &mut self.slots {
                if let Some(running) = entry.running.take() {
                    let _ = running.submitted.ticket.send(Err(PoolError::ShuttingDown));
                    entry.slot.kill().await;
                }
            }
        }

        // Drain any intake that raced shutdown.
        if self.shutdown.is_some() {
            while let Ok(submitted) = job_rx.try_recv() {
                let _ = submitted.ticket.send(Err(PoolError::ShuttingDown));
            }
        }
    }

    fn begin_shutdown(
        &mut self,
        grace: Duration,
        ack: Option<oneshot::Sender<()>>,
        job_rx: &mut mpsc::Receiver<SubmittedJob>,
    ) {
        if self.shutdown.is_some() {
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            return;
        }
        tracing::info!(grace_ms = grace.as_millis() as u64, "pool shutting down");
        self.shutdown = Some(ShutdownState {
            deadline: Instant::now() + grace,
            ack,
        });

        // New and requeued work is rejected; only in-flight jobs may finish.
        while let Ok(submitted) = job_rx.try_recv() {
            let _ = submitted.ticket.send(Err(PoolError::ShuttingDown));
        }
        for submitted in self.requeue.drain(..) {
            let _ = submitted.ticket.send(Err(PoolError::ShuttingDown));
        }
    }

    async fn finalize_shutdown(&mut self) {
        for entry in &mut self.slots {
            if let Some(running) = entry.running.take() {
                let _ = running.submitted.ticket.send(Err(PoolError::ShuttingDown));
            }
            entry.slot.kill().await;
        }
        if let Some(shutdown) = &mut self.shutdown
            && let Some(ack) = shutdown.ack.take()
        {
            let _ = ack.send(());
        }
        tracing::info!("pool stopped");
    }

    fn health(&self) -> PoolHealth {
        let live = self
            .slots
            .iter()
            .filter(|entry| {
                matches!(entry.slot.state, SlotState::Idle | SlotState::Busy)
            })
            .count();
        let busy = self
            .slots
            .iter()
            .filter(|entry| entry.slot.state == SlotState::Busy)
            .count();
        PoolHealth {
            pool_size: self.config.pool_size,
            live_workers: live,
            busy_workers: busy,
            // Filled in by the handle from submit-channel capacity.
            queue_depth: 0,
            jobs_executed: self.counters.jobs_executed,
            timeouts: self.counters.timeouts,
            crashes: self.counters.crashes,
            memory_retirements: self.counters.memory_retirements,
            slots: self
                .slots
                .iter()
                .map(|entry| SlotHealth {
                    id: entry.slot.id,
                    state: entry.slot.state,
                    pid: entry.slot.pid(),
                    memory_mb: entry.slot.memory_mb,
                    current_job: entry.slot.current_job,
                })
                .collect(),
        }
    }
}
