use crate::factory::{PlatformProcessManager, PlatformProcessManagerFactory};
use embedded_cassandra_core::{
    CassandraError, OutputDrain, ProcessHandle, ProcessLifecycle,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, info_span};

/// How long `run` waits for the last output after the process exited
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns a child process and drains its merged output on a background task.
///
/// Blank arguments are dropped before spawning. Each started process gets its
/// own `process{seq, pid}` span; the sequence is local to this runner.
pub struct RunProcess<M: ProcessLifecycle = PlatformProcessManager> {
    working_directory: Option<PathBuf>,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
    manager: M,
    sequence: AtomicU64,
}

impl RunProcess {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(arguments: I) -> Self {
        Self::with_manager(
            PlatformProcessManagerFactory::create_process_manager(),
            arguments,
        )
    }
}

impl<M: ProcessLifecycle> RunProcess<M> {
    pub fn with_manager<S: ToString, I: IntoIterator<Item = S>>(manager: M, arguments: I) -> Self {
        let arguments = arguments
            .into_iter()
            .map(|arg| arg.to_string())
            .filter(|arg| !arg.trim().is_empty())
            .collect();
        Self {
            working_directory: None,
            arguments,
            environment: BTreeMap::new(),
            manager,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn env<T: ToString>(mut self, key: T, value: T) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs<T: ToString, I: IntoIterator<Item = (T, T)>>(mut self, iter: I) -> Self {
        for (key, value) in iter {
            self.environment.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Spawns the process. Its output is drained in the background and logged
    /// at `debug` under target `embedded_cassandra::process`; use
    /// [`start_with_output`](Self::start_with_output) to consume it instead.
    pub async fn start(&self) -> Result<M::Handle, CassandraError> {
        let (handle, _drain) = self
            .start_with_output(|line| debug!(target: "embedded_cassandra::process", "{line}"))
            .await?;
        Ok(handle)
    }

    fn spawn(&self) -> Result<M::Handle, CassandraError> {
        if self.arguments.is_empty() {
            return Err(CassandraError::InvalidArgument(
                "no command to run".to_string(),
            ));
        }
        info!(
            command = ?self.arguments,
            working_directory = ?self.working_directory,
            environment = ?self.environment,
            "Starting process"
        );
        let handle = self.manager.spawn_process(
            &self.arguments,
            self.working_directory.as_deref(),
            &self.environment,
        )?;
        Ok(handle)
    }

    /// Spawns the process and feeds every non-blank output line to
    /// `consumer` from a background task.
    pub async fn start_with_output<C>(
        &self,
        consumer: C,
    ) -> Result<(M::Handle, Option<OutputDrain>), CassandraError>
    where
        C: FnMut(&str) + Send + 'static,
    {
        let mut handle = self.spawn()?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("process", seq, pid = handle.pid());
        let drain = handle.take_output().map(|output| output.drain(span, consumer));
        Ok((handle, drain))
    }

    /// Starts the process and waits for it to exit, returning its exit code.
    /// Signal deaths are reported as `128 + signal`.
    pub async fn run<C>(&self, consumer: C) -> Result<i32, CassandraError>
    where
        C: FnMut(&str) + Send + 'static,
    {
        let (mut handle, drain) = self.start_with_output(consumer).await?;
        let status = handle.wait().await;
        if let Some(drain) = drain {
            drain.join(DRAIN_JOIN_TIMEOUT).await;
        }
        handle.close().await;

        let status = status?;
        debug!("Process {} exited with {status:?}", handle.pid());
        status.exit_code().ok_or_else(|| {
            CassandraError::Other(anyhow::anyhow!(
                "exit status of process {} is unknown",
                handle.pid()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_blank_arguments_are_dropped() {
        let runner = RunProcess::new(["sleep", "", "  ", "100"]);
        assert_eq!(runner.arguments(), ["sleep", "100"]);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let runner = RunProcess::new(["", " "]);
        let err = runner.start().await.err().unwrap();
        assert!(matches!(err, CassandraError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_started_process_is_never_blocked_on_output() {
        // Well past a pipe buffer's worth of output
        let runner = RunProcess::new([
            "sh",
            "-c",
            "i=0; while [ $i -lt 5000 ]; do echo \"line $i of a chatty process\"; i=$((i+1)); done",
        ]);
        let mut handle = runner.start().await.unwrap();
        assert!(handle.take_output().is_none());

        let status = handle.wait_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(status.and_then(|s| s.exit_code()), Some(0));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let runner = RunProcess::new(["/definitely/not/a/program"]);
        let err = runner.run(|_| {}).await.unwrap_err();
        assert!(matches!(err, CassandraError::Io(_)));
    }

    #[tokio::test]
    async fn test_run_returns_exit_code_and_output() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let code = RunProcess::new(["sh", "-c", "echo $GREETING; echo oops >&2; exit 7"])
            .env("GREETING", "hello")
            .run(move |line| sink.lock().unwrap().push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(code, 7);

        let mut lines = lines.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, vec!["hello", "oops"]);
    }

    #[tokio::test]
    async fn test_each_start_uses_a_new_sequence() {
        let runner = RunProcess::new(["true"]);
        for _ in 0..3 {
            let (mut handle, drain) = runner.start_with_output(|_| {}).await.unwrap();
            handle.wait().await.unwrap();
            if let Some(drain) = drain {
                drain.join(Duration::from_secs(1)).await;
            }
        }
        assert_eq!(runner.sequence.load(Ordering::Relaxed), 3);
    }
}
