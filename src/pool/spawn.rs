//! Worker process spawning.
//!
//! The spawner is a trait so pool tests can substitute how worker processes
//! are launched without touching scheduling logic. The production spawner
//! re-executes the daemon binary with the `worker` subcommand.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Launches one worker process with piped stdin/stdout.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self) -> io::Result<Child>;
}

/// Spawns `<program> worker` with framed stdio. Stderr is inherited so worker
/// logs land in the daemon's log stream.
pub struct ProcessSpawner {
    program: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Re-execute the current binary as the worker.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
        })
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> io::Result<Child> {
        Command::new(&self.program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}
