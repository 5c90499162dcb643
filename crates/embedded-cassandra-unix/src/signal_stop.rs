use crate::UnixProcessManager;
use anyhow::{Result, bail};
use async_trait::async_trait;
use embedded_cassandra_core::{
    ProcessId, ProcessTermination, StopSignal, StopStrategy, TerminationResult,
};
use tracing::debug;

/// Graceful stop by signal, SIGTERM unless configured otherwise
#[derive(Clone, Default)]
pub struct SignalStop {
    signal: StopSignal,
    manager: UnixProcessManager,
}

impl SignalStop {
    pub fn new(signal: StopSignal) -> Self {
        Self {
            signal,
            manager: UnixProcessManager::new(),
        }
    }

    pub fn with_manager(signal: StopSignal, manager: UnixProcessManager) -> Self {
        Self { signal, manager }
    }

    pub fn signal(&self) -> StopSignal {
        self.signal
    }
}

#[async_trait]
impl StopStrategy for SignalStop {
    async fn request_stop(&self, pid: ProcessId) -> Result<()> {
        match self.manager.send_signal(pid, self.signal).await {
            TerminationResult::Success => Ok(()),
            TerminationResult::ProcessNotFound => {
                debug!("Process {pid} is already gone, nothing to signal");
                Ok(())
            }
            TerminationResult::AccessDenied => {
                bail!("not permitted to send {} to process {pid}", self.signal)
            }
            TerminationResult::Failed(reason) => bail!(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_cassandra_core::{ProcessHandle, ProcessLifecycle, ProcessStatus};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_stops_process() {
        let manager = UnixProcessManager::new();
        let mut handle = manager
            .spawn_process(
                &["sleep".to_string(), "30".to_string()],
                None,
                &BTreeMap::new(),
            )
            .unwrap();

        let stop = SignalStop::with_manager(StopSignal::Interrupt, manager);
        stop.request_stop(handle.pid()).await.unwrap();

        let status = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status, Some(ProcessStatus::Signaled(2)));
    }

    #[tokio::test]
    async fn test_stop_of_exited_process_is_ok() {
        let manager = UnixProcessManager::new();
        let mut handle = manager
            .spawn_process(&["true".to_string()], None, &BTreeMap::new())
            .unwrap();
        handle.wait().await.unwrap();

        let stop = SignalStop::default();
        assert_eq!(stop.signal(), StopSignal::Terminate);
        assert!(stop.request_stop(handle.pid()).await.is_ok());
    }
}
