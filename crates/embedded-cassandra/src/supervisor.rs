use crate::runner::RunProcess;
use anyhow::{Result, bail};
use async_trait::async_trait;
use embedded_cassandra_core::{
    CassandraError, OutputDrain, ProcessHandle, ProcessId, ProcessStatus, StopStrategy,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Graceful stop requests made before the process is destroyed
const GRACEFUL_ATTEMPTS: u32 = 2;
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    StopRequested { attempt: u32 },
    Stopped,
    /// Survived the forced destroy
    Unresponsive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was not alive when `stop` was called
    AlreadyStopped,
    Stopped { graceful_attempts: u32, forced: bool },
}

struct Supervised {
    handle: Box<dyn ProcessHandle>,
    output: Option<OutputDrain>,
}

/// Wraps one started process with the stop protocol.
///
/// `stop` asks the process to shut down through the injected
/// [`StopStrategy`], waits a grace period, asks once more, then destroys the
/// process tree. Only a process that outlives all of that is an error. Each
/// stop request is itself bounded by the grace period.
///
/// `is_alive` and `state` never wait for a stop in progress; while one runs
/// they report what the last completed step observed.
pub struct NodeSupervisor {
    name: String,
    pid: ProcessId,
    stop_strategy: Arc<dyn StopStrategy>,
    grace_period: Duration,
    alive: AtomicBool,
    state: watch::Sender<SupervisorState>,
    inner: Mutex<Supervised>,
}

impl NodeSupervisor {
    pub fn new<H>(name: impl Into<String>, handle: H, stop_strategy: Arc<dyn StopStrategy>) -> Self
    where
        H: ProcessHandle + 'static,
    {
        Self {
            name: name.into(),
            pid: handle.pid(),
            stop_strategy,
            grace_period: DEFAULT_GRACE_PERIOD,
            alive: AtomicBool::new(true),
            state: watch::Sender::new(SupervisorState::Running),
            inner: Mutex::new(Supervised {
                handle: Box::new(handle),
                output: None,
            }),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Output drain joined once the process has stopped
    pub fn with_output(mut self, output: Option<OutputDrain>) -> Self {
        self.inner.get_mut().output = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watches state transitions of the stop protocol
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub async fn is_alive(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut inner) => self.observe(&mut inner.handle).await,
            Err(_) => self.alive.load(Ordering::SeqCst),
        }
    }

    /// Exit status if the process has already exited
    pub async fn exit_status(&self) -> Option<ProcessStatus> {
        let mut inner = self.inner.lock().await;
        inner.handle.wait_timeout(Duration::ZERO).await.ok().flatten()
    }

    pub async fn stop(&self) -> Result<StopOutcome, CassandraError> {
        let mut inner = self.inner.lock().await;

        if !self.observe(&mut inner.handle).await {
            debug!("'{}:{}' is not running", self.name, self.pid);
            self.release(&mut inner).await;
            return Ok(StopOutcome::AlreadyStopped);
        }

        for attempt in 1..=GRACEFUL_ATTEMPTS {
            self.state.send_replace(SupervisorState::StopRequested { attempt });
            info!("Stopping '{}:{}' (attempt {attempt})", self.name, self.pid);
            self.request_stop().await;
            if self.wait_for_exit(&mut inner.handle).await {
                self.release(&mut inner).await;
                return Ok(StopOutcome::Stopped {
                    graceful_attempts: attempt,
                    forced: false,
                });
            }
        }

        warn!(
            "'{}:{}' is still running after {GRACEFUL_ATTEMPTS} stop requests, destroying it",
            self.name, self.pid
        );
        let result = inner.handle.destroy_forcibly().await;
        debug!("Destroy of '{}:{}': {result:?}", self.name, self.pid);

        if self.wait_for_exit(&mut inner.handle).await {
            self.release(&mut inner).await;
            return Ok(StopOutcome::Stopped {
                graceful_attempts: GRACEFUL_ATTEMPTS,
                forced: true,
            });
        }

        self.state.send_replace(SupervisorState::Unresponsive);
        Err(CassandraError::Shutdown {
            name: self.name.clone(),
            pid: self.pid,
        })
    }

    /// One graceful request, abandoned after the grace period. Dropping an
    /// abandoned [`CommandStop`] kills its command.
    async fn request_stop(&self) {
        match tokio::time::timeout(self.grace_period, self.stop_strategy.request_stop(self.pid))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Stop request for '{}:{}' failed: {e:#}", self.name, self.pid);
            }
            Err(_) => {
                warn!(
                    "Stop request for '{}:{}' did not finish within {:?}",
                    self.name, self.pid, self.grace_period
                );
            }
        }
    }

    async fn wait_for_exit(&self, handle: &mut Box<dyn ProcessHandle>) -> bool {
        match handle.wait_timeout(self.grace_period).await {
            Ok(Some(status)) => {
                debug!("'{}:{}' exited with {status:?}", self.name, self.pid);
                self.alive.store(false, Ordering::SeqCst);
                true
            }
            Ok(None) => !self.observe(handle).await,
            Err(e) => {
                warn!("Failed to wait for '{}:{}': {e:#}", self.name, self.pid);
                !self.observe(handle).await
            }
        }
    }

    async fn observe(&self, handle: &mut Box<dyn ProcessHandle>) -> bool {
        let alive = handle.is_alive().await;
        self.alive.store(alive, Ordering::SeqCst);
        alive
    }

    async fn release(&self, inner: &mut Supervised) {
        inner.handle.close().await;
        if let Some(output) = inner.output.take() {
            output.join(DRAIN_JOIN_TIMEOUT).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.state.send_replace(SupervisorState::Stopped);
        info!("'{}:{}' has been stopped", self.name, self.pid);
    }
}

/// Graceful stop through an external command, e.g. `nodetool stopdaemon`.
/// Every `{pid}` in the arguments is replaced with the process id.
#[derive(Debug, Clone)]
pub struct CommandStop {
    arguments: Vec<String>,
    working_directory: Option<PathBuf>,
}

impl CommandStop {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(arguments: I) -> Self {
        Self {
            arguments: arguments.into_iter().map(|arg| arg.to_string()).collect(),
            working_directory: None,
        }
    }

    pub fn working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }
}

#[async_trait]
impl StopStrategy for CommandStop {
    async fn request_stop(&self, pid: ProcessId) -> Result<()> {
        let pid_text = pid.to_string();
        let arguments = self
            .arguments
            .iter()
            .map(|arg| arg.replace("{pid}", &pid_text));
        let mut runner = RunProcess::new(arguments);
        if let Some(directory) = &self.working_directory {
            runner = runner.working_directory(directory);
        }
        let code = runner
            .run(|line| debug!(target: "embedded_cassandra::stop", "{line}"))
            .await?;
        if code != 0 {
            bail!("stop command {:?} exited with {code}", runner.arguments());
        }
        Ok(())
    }
}

/// Graceful stop through an async closure
pub struct FnStop<F>(F);

pub fn stop_fn<F, Fut>(f: F) -> FnStop<F>
where
    F: Fn(ProcessId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnStop(f)
}

#[async_trait]
impl<F, Fut> StopStrategy for FnStop<F>
where
    F: Fn(ProcessId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn request_stop(&self, pid: ProcessId) -> Result<()> {
        (self.0)(pid).await
    }
}
