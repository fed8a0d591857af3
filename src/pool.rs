//! Process-isolated query worker pool.
//!
//! Workers are separate OS processes so a pathological query can neither
//! stall nor corrupt the daemon, and its memory is reclaimed deterministically
//! by killing the process.

pub mod manager;
pub mod protocol;
pub mod slot;
pub mod spawn;

pub use manager::{JobOutcome, JobPayload, PoolHandle, PoolHealth, QueryJob, WorkerPool};
pub use spawn::{ProcessSpawner, WorkerSpawner};
