//! Embedded Apache Cassandra for tests: download a distribution, launch it
//! as a child process, wait for its listeners and stop it deterministically.

pub mod artifact;
pub mod cassandra;
pub mod factory;
pub mod readiness;
pub mod runner;
pub mod supervisor;

pub use artifact::{ArtifactResolver, CachedArtifact};
pub use cassandra::{CassandraLayer, Running, Uninitialized};
pub use factory::{PlatformProcessHandle, PlatformProcessManager, PlatformProcessManagerFactory};
pub use readiness::{Readiness, ReadinessProber, ReadinessReport};
pub use runner::RunProcess;
pub use supervisor::{CommandStop, FnStop, NodeSupervisor, StopOutcome, SupervisorState, stop_fn};

#[cfg(unix)]
pub use embedded_cassandra_unix::SignalStop;

// Re-export core functionality
pub use embedded_cassandra_core::*;
