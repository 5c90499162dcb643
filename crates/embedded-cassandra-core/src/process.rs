use crate::output::ProcessOutput;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Status of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited with the given exit code
    Exited(i32),
    /// Process was terminated by the given signal
    Signaled(i32),
    /// Process status is unknown
    Unknown,
}

impl ProcessStatus {
    /// Exit code in shell convention: signals map to `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(code) => Some(*code),
            ProcessStatus::Signaled(signal) => Some(128 + signal),
            ProcessStatus::Running | ProcessStatus::Unknown => None,
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the target is gone or has been told to go
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Platform-neutral signal used to ask a process to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopSignal {
    #[default]
    Terminate,
    Interrupt,
    Kill,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Terminate => f.write_str("SIGTERM"),
            StopSignal::Interrupt => f.write_str("SIGINT"),
            StopSignal::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// Trait representing a handle to a spawned process.
///
/// A handle is owned by whoever spawned it. The node supervisor holds it to
/// issue stop requests but never re-spawns through it: one handle, one
/// start/stop cycle.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id
    fn pid(&self) -> ProcessId;

    /// Arguments the process was started with, program first
    fn arguments(&self) -> &[String];

    fn working_directory(&self) -> Option<&Path>;

    /// Variables added on top of the inherited environment
    fn environment(&self) -> &BTreeMap<String, String>;

    /// Takes the merged stdout/stderr stream. Returns `None` once taken.
    fn take_output(&mut self) -> Option<ProcessOutput>;

    /// Check if the process is still running (non-blocking)
    async fn is_alive(&mut self) -> bool;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Wait at most `timeout` for the process to exit.
    /// Returns `None` if it is still running afterwards.
    async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ProcessStatus>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Kill the process and everything it spawned, without asking
    async fn destroy_forcibly(&mut self) -> TerminationResult;

    /// Release the I/O handles still held for the process
    async fn close(&mut self);
}

#[async_trait]
impl ProcessHandle for Box<dyn ProcessHandle> {
    fn pid(&self) -> ProcessId {
        (**self).pid()
    }

    fn arguments(&self) -> &[String] {
        (**self).arguments()
    }

    fn working_directory(&self) -> Option<&Path> {
        (**self).working_directory()
    }

    fn environment(&self) -> &BTreeMap<String, String> {
        (**self).environment()
    }

    fn take_output(&mut self) -> Option<ProcessOutput> {
        (**self).take_output()
    }

    async fn is_alive(&mut self) -> bool {
        (**self).is_alive().await
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        (**self).wait().await
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ProcessStatus>> {
        (**self).wait_timeout(timeout).await
    }

    async fn destroy_forcibly(&mut self) -> TerminationResult {
        (**self).destroy_forcibly().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// Spawns processes for the current platform
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Spawn `arguments[0]` with the remaining arguments. Stdout and stderr
    /// are captured and exposed through [`ProcessHandle::take_output`].
    fn spawn_process(
        &self,
        arguments: &[String],
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<Self::Handle>;
}

/// Signal delivery and process-tree termination
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Deliver `signal` to a single process
    async fn send_signal(&self, pid: ProcessId, signal: StopSignal) -> TerminationResult;

    /// Find all descendants of a given process, deepest first
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Kill an entire process tree (descendants first, then the root)
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;
}

/// The graceful half of the stop protocol: ask the node to shut down.
///
/// Implementations must not wait for the process to exit; the supervisor
/// owns the waiting and the escalation.
#[async_trait]
pub trait StopStrategy: Send + Sync {
    async fn request_stop(&self, pid: ProcessId) -> Result<()>;
}
