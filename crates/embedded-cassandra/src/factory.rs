use embedded_cassandra_core::{StopSignal, StopStrategy};
use std::sync::Arc;

#[cfg(not(unix))]
compile_error!("embedded-cassandra only supports Unix platforms");

#[cfg(unix)]
pub type PlatformProcessManager = embedded_cassandra_unix::UnixProcessManager;

#[cfg(unix)]
pub type PlatformProcessHandle = embedded_cassandra_unix::UnixProcessHandle;

/// Selects the process manager for the target platform at compile time
pub struct PlatformProcessManagerFactory;

impl PlatformProcessManagerFactory {
    pub fn create_process_manager() -> PlatformProcessManager {
        #[cfg(unix)]
        return embedded_cassandra_unix::UnixProcessManagerFactory::create_process_manager();
    }

    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        return embedded_cassandra_unix::UnixProcessManagerFactory::platform_name();
    }

    /// Graceful stop by delivering `signal`
    pub fn signal_stop(signal: StopSignal) -> Arc<dyn StopStrategy> {
        #[cfg(unix)]
        return Arc::new(embedded_cassandra_unix::SignalStop::new(signal));
    }
}
