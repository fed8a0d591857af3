//! Worker slot: the pool-side handle for one worker process.
//!
//! A slot owns its child process exclusively; a worker never outlives its
//! slot's process handle. Each (re)spawn bumps the slot's generation, and
//! every message from a slot's stdout reader carries the generation it was
//! spawned under, so events from a process the manager already killed are
//! recognizable as stale and dropped.

use crate::JobId;
use crate::error::PoolError;
use crate::pool::protocol::{self, WorkerReply};
use crate::pool::spawn::WorkerSpawner;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;

pub type SlotId = usize;

/// Spawn attempts per slot before giving up.
const SPAWN_RETRIES: u32 = 3;
/// Pause between spawn retries.
const SPAWN_RETRY_DELAY_MS: u64 = 100;

/// Process-lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Busy,
    Crashed,
    Restarting,
}

/// Messages from a slot's stdout reader task to the manager.
#[derive(Debug)]
pub(crate) enum SlotEvent {
    /// One framed reply from the worker.
    Reply {
        slot_id: SlotId,
        generation: u64,
        reply: WorkerReply,
    },
    /// The worker's stdout closed: process exit (clean or crash).
    Exited { slot_id: SlotId, generation: u64 },
}

/// One pool slot and its live worker process.
pub struct WorkerSlot {
    pub id: SlotId,
    pub state: SlotState,
    pub current_job: Option<JobId>,
    /// Resident memory estimate from the last post-job sample, in MiB.
    pub memory_mb: u64,
    pub(crate) generation: u64,
    child: Child,
    stdin: ChildStdin,
}

impl WorkerSlot {
    /// Spawn the slot's worker process, retrying a few times before failing.
    /// Starts the stdout reader task feeding `event_tx`.
    pub(crate) async fn spawn(
        spawner: &dyn WorkerSpawner,
        id: SlotId,
        generation: u64,
        event_tx: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Self, PoolError> {
        let mut last_error = None;
        for attempt in 1..=SPAWN_RETRIES {
            match spawner.spawn() {
                Ok(mut child) => {
                    let stdin = child
                        .stdin
                        .take()
                        .ok_or_else(|| PoolError::SpawnFailed("worker stdin not piped".into()))?;
                    let stdout = child
                        .stdout
                        .take()
                        .ok_or_else(|| PoolError::SpawnFailed("worker stdout not piped".into()))?;

                    tokio::spawn(read_replies(id, generation, stdout, event_tx));

                    tracing::info!(
                        slot_id = id,
                        generation,
                        pid = child.id(),
                        "worker spawned"
                    );
                    return Ok(Self {
                        id,
                        state: SlotState::Idle,
                        current_job: None,
                        memory_mb: 0,
                        generation,
                        child,
                        stdin,
                    });
                }
                Err(err) => {
                    tracing::warn!(slot_id = id, attempt, error = %err, "worker spawn failed");
                    last_error = Some(err);
                    tokio::time::sleep(std::time::Duration::from_millis(SPAWN_RETRY_DELAY_MS))
                        .await;
                }
            }
        }
        Err(PoolError::SpawnFailed(
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown spawn failure".into()),
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send one framed request to the worker. A send failure means the
    /// process is gone; the caller handles it as a crash.
    pub(crate) async fn send(&mut self, payload: &[u8]) -> std::io::Result<()> {
        protocol::write_frame_async(&mut self.stdin, payload).await
    }

    /// Force-kill the worker process and reap it.
    pub(crate) async fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(slot_id = self.id, error = %err, "kill on exited worker");
        }
        let _ = self.child.wait().await;
    }

    /// Reap an already-exited child without blocking the manager.
    pub(crate) async fn reap(&mut self) {
        let _ = self.child.wait().await;
    }

    /// Sample the worker's resident memory, in MiB. Returns zero when the
    /// process is already gone.
    pub(crate) fn sample_memory_mb(&mut self, system: &mut System) -> u64 {
        let Some(pid) = self.child.id() else {
            return 0;
        };
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let memory_mb = system
            .process(pid)
            .map(|process| process.memory() / (1024 * 1024))
            .unwrap_or(0);
        self.memory_mb = memory_mb;
        memory_mb
    }
}

/// Reader task: forwards framed replies until the worker's stdout closes,
/// then reports the exit. Runs once per process generation.
async fn read_replies(
    slot_id: SlotId,
    generation: u64,
    mut stdout: tokio::process::ChildStdout,
    event_tx: mpsc::UnboundedSender<SlotEvent>,
) {
    loop {
        match protocol::read_frame_async(&mut stdout).await {
            Ok(Some(frame)) => match serde_json::from_slice::<WorkerReply>(&frame) {
                Ok(reply) => {
                    if event_tx
                        .send(SlotEvent::Reply {
                            slot_id,
                            generation,
                            reply,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(slot_id, generation, error = %err, "undecodable worker reply");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(slot_id, generation, error = %err, "worker stdout read failed");
                break;
            }
        }
    }
    let _ = event_tx.send(SlotEvent::Exited {
        slot_id,
        generation,
    });
}
