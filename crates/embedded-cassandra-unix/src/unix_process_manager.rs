use anyhow::Result;
use async_trait::async_trait;
use embedded_cassandra_core::{
    ProcessHandle, ProcessId, ProcessLifecycle, ProcessOutput, ProcessStatus, ProcessTermination,
    StopSignal, TerminationResult,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Stdio};
    use std::sync::{Arc, Mutex};
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    fn to_nix_signal(signal: StopSignal) -> Signal {
        match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    fn to_status(status: ExitStatus) -> ProcessStatus {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessStatus::Exited(code),
            (None, Some(signal)) => ProcessStatus::Signaled(signal),
            (None, None) => ProcessStatus::Unknown,
        }
    }

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        pid: ProcessId,
        arguments: Vec<String>,
        working_directory: Option<PathBuf>,
        environment: BTreeMap<String, String>,
        output: Option<ProcessOutput>,
        status: Option<ProcessStatus>,
        manager: UnixProcessManager,
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn pid(&self) -> ProcessId {
            self.pid
        }

        fn arguments(&self) -> &[String] {
            &self.arguments
        }

        fn working_directory(&self) -> Option<&Path> {
            self.working_directory.as_deref()
        }

        fn environment(&self) -> &BTreeMap<String, String> {
            &self.environment
        }

        fn take_output(&mut self) -> Option<ProcessOutput> {
            self.output.take()
        }

        async fn is_alive(&mut self) -> bool {
            if self.status.is_some() {
                return false;
            }
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    let status = to_status(status);
                    debug!("Process {} is no longer running ({status:?})", self.pid);
                    self.status = Some(status);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    // Fall back to signal 0 when the child cannot be polled
                    warn!("Failed to poll process {}: {e}", self.pid);
                    signal::kill(NixPid::from_raw(self.pid as i32), None).is_ok()
                }
            }
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            if let Some(status) = self.status {
                return Ok(status);
            }
            let status = to_status(self.child.wait().await?);
            self.status = Some(status);
            Ok(status)
        }

        async fn destroy_forcibly(&mut self) -> TerminationResult {
            let result = self.manager.terminate_process_tree(self.pid).await;
            if let Err(e) = self.child.start_kill() {
                debug!("Child {} kill cleanup skipped: {e}", self.pid);
            }
            result
        }

        async fn close(&mut self) {
            self.output = None;
            self.child.stdin.take();
            self.child.stdout.take();
            self.child.stderr.take();
        }
    }

    /// Unix-specific process manager with process tree management
    #[derive(Clone)]
    pub struct UnixProcessManager {
        system: Arc<Mutex<System>>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessManager {
        pub fn new() -> Self {
            debug!("Initializing Unix process manager");
            Self {
                system: Arc::new(Mutex::new(System::new())),
            }
        }

        fn signal_group(pgid: ProcessId, signal: Signal) -> TerminationResult {
            match signal::killpg(NixPid::from_raw(pgid as i32), signal) {
                Ok(()) => {
                    debug!("Sent {signal} to process group {pgid}");
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(Errno::EPERM) => TerminationResult::AccessDenied,
                Err(e) => TerminationResult::Failed(format!("{signal} to process group failed: {e}")),
            }
        }

        /// Recursively find all child processes
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    // Grandchildren first
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        fn spawn_process(
            &self,
            arguments: &[String],
            working_dir: Option<&Path>,
            env: &BTreeMap<String, String>,
        ) -> std::io::Result<Self::Handle> {
            let (program, args) = arguments.split_first().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no program to run")
            })?;

            let mut cmd = Command::new(program);
            cmd.args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            // Own process group, so the whole tree can be signalled at once
            cmd.process_group(0);

            let mut child = cmd.spawn()?;
            let pid = child.id().ok_or_else(|| {
                std::io::Error::other(format!("{program} exited before its pid was known"))
            })?;

            let output = match (child.stdout.take(), child.stderr.take()) {
                (Some(stdout), Some(stderr)) => Some(ProcessOutput::from_pipes(stdout, stderr)),
                (Some(stdout), None) => Some(ProcessOutput::from_pipe(stdout)),
                (None, Some(stderr)) => Some(ProcessOutput::from_pipe(stderr)),
                (None, None) => None,
            };

            info!("Spawned Unix process: {program} (PID: {pid}) with args: {args:?}");

            Ok(UnixProcessHandle {
                child,
                pid,
                arguments: arguments.to_vec(),
                working_directory: working_dir.map(Path::to_path_buf),
                environment: env.clone(),
                output,
                status: None,
                manager: self.clone(),
            })
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn send_signal(&self, pid: ProcessId, stop: StopSignal) -> TerminationResult {
            let signal = to_nix_signal(stop);
            match signal::kill(NixPid::from_raw(pid as i32), signal) {
                Ok(()) => {
                    debug!("Sent {signal} to process {pid}");
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    debug!("Process {pid} not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to signal process {pid}");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send {signal} to process {pid}: {e}");
                    TerminationResult::Failed(format!("{signal} failed: {e}"))
                }
            }
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let system = self.system.clone();
            tokio::task::spawn_blocking(move || {
                let mut system = system
                    .lock()
                    .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
                system.refresh_processes_specifics(
                    sysinfo::ProcessesToUpdate::All,
                    true,
                    sysinfo::ProcessRefreshKind::default(),
                );

                let mut children = Vec::new();
                Self::find_children_recursive(&system, parent_pid, &mut children);
                Ok::<_, anyhow::Error>(children)
            })
            .await?
        }

        async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
            debug!("Terminating process tree for root PID {root_pid}");

            // Enumerate before killing; orphans get re-parented away from the root
            let children = match self.find_child_processes(root_pid).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Failed to find child processes for PID {root_pid}: {e}");
                    Vec::new()
                }
            };

            let group = Self::signal_group(root_pid, Signal::SIGKILL);

            for child_pid in &children {
                match self.send_signal(*child_pid, StopSignal::Kill).await {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    result => {
                        warn!("Failed to kill child process {child_pid}: {result:?}");
                    }
                }
            }

            match self.send_signal(root_pid, StopSignal::Kill).await {
                TerminationResult::ProcessNotFound if group == TerminationResult::Success => {
                    TerminationResult::Success
                }
                result => result,
            }
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
