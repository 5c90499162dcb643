use crate::artifact::{ArtifactResolver, CachedArtifact};
use crate::factory::PlatformProcessManagerFactory;
use crate::readiness::{ReadinessProber, ReadinessReport};
use crate::runner::RunProcess;
use crate::supervisor::{NodeSupervisor, StopOutcome};
use backon::{ExponentialBuilder, Retryable};
use embedded_cassandra_core::{
    CassandraConfig, CassandraError, PortSpec, ProcessId, ProcessStatus, StopStrategy,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Token in the configured command replaced with the resolved artifact path
pub const ARTIFACT_TOKEN: &str = "{artifact}";

pub struct Uninitialized;

pub struct Running {
    supervisor: NodeSupervisor,
    artifact: Option<CachedArtifact>,
}

/// One embedded Cassandra node: resolve, launch, wait for readiness, stop.
pub struct CassandraLayer<State = Uninitialized> {
    config: CassandraConfig,
    resolver: ArtifactResolver,
    prober: ReadinessProber,
    stop_strategy: Option<Arc<dyn StopStrategy>>,
    state: State,
}

impl<State> CassandraLayer<State> {
    pub fn config(&self) -> &CassandraConfig {
        &self.config
    }

    /// Probes the configured ports once
    pub async fn probe(&self) -> Result<ReadinessReport, CassandraError> {
        self.prober.probe(&self.config.ports).await
    }
}

impl CassandraLayer<Uninitialized> {
    pub fn new(config: CassandraConfig) -> Result<Self, CassandraError> {
        // Validate readiness config at construction time
        config.readiness.validate().map_err(|e| {
            CassandraError::InvalidArgument(format!("Invalid readiness config: {e}"))
        })?;
        if let Some(artifact) = &config.artifact {
            if artifact.version != config.version {
                return Err(CassandraError::InvalidArgument(format!(
                    "artifact version ({}) does not match node version ({})",
                    artifact.version, config.version
                )));
            }
        }

        let prober = ReadinessProber::new(config.address)
            .with_connect_timeout(config.readiness.connect_timeout());
        Ok(Self {
            config,
            resolver: ArtifactResolver::new(),
            prober,
            stop_strategy: None,
            state: Uninitialized,
        })
    }

    /// Replaces the default graceful stop, a signal per [`StopConfig`](embedded_cassandra_core::StopConfig)
    pub fn with_stop_strategy(mut self, stop_strategy: Arc<dyn StopStrategy>) -> Self {
        self.stop_strategy = Some(stop_strategy);
        self
    }

    pub fn with_resolver(mut self, resolver: ArtifactResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Launches the node and waits until all enabled features accept
    /// connections. The node is stopped again if it does not get there.
    pub async fn start(self) -> Result<CassandraLayer<Running>, CassandraError> {
        let CassandraLayer {
            config,
            resolver,
            prober,
            stop_strategy,
            ..
        } = self;

        let artifact = match &config.artifact {
            Some(request) => Some(resolver.resolve(request).await?),
            None => None,
        };
        let command = substitute_artifact(&config.command, artifact.as_ref());

        if config.verify_ports {
            prober.ensure_ports_free(&config.ports).await?;
        }

        let mut runner = RunProcess::new(command).envs(config.env.clone());
        if let Some(directory) = &config.working_directory {
            runner = runner.working_directory(directory);
        }
        let (handle, output) = runner
            .start_with_output(|line| info!(target: "embedded_cassandra::node", "{line}"))
            .await?;

        let stop_strategy = stop_strategy
            .unwrap_or_else(|| PlatformProcessManagerFactory::signal_stop(config.stop.signal));
        let supervisor = NodeSupervisor::new(config.name.clone(), handle, stop_strategy.clone())
            .with_grace_period(config.stop.grace_period())
            .with_output(output);
        info!(
            "'{}:{}' started ({} {})",
            config.name,
            supervisor.pid(),
            config.version,
            PlatformProcessManagerFactory::platform_name()
        );

        if let Err(e) = await_startup(&supervisor, &prober, &config).await {
            warn!("'{}:{}' failed to start: {e}", config.name, supervisor.pid());
            if let Err(stop_error) = supervisor.stop().await {
                error!("Could not stop '{}' after failed startup: {stop_error}", config.name);
            }
            return Err(e);
        }

        Ok(CassandraLayer {
            config,
            resolver,
            prober,
            stop_strategy: Some(stop_strategy),
            state: Running {
                supervisor,
                artifact,
            },
        })
    }
}

impl CassandraLayer<Running> {
    pub fn pid(&self) -> ProcessId {
        self.state.supervisor.pid()
    }

    /// The resolved distribution, if one was configured
    pub fn artifact(&self) -> Option<&CachedArtifact> {
        self.state.artifact.as_ref()
    }

    pub fn supervisor(&self) -> &NodeSupervisor {
        &self.state.supervisor
    }

    pub async fn is_alive(&self) -> bool {
        self.state.supervisor.is_alive().await
    }

    pub async fn stop(&self) -> Result<StopOutcome, CassandraError> {
        self.state.supervisor.stop().await
    }
}

fn substitute_artifact(command: &[String], artifact: Option<&CachedArtifact>) -> Vec<String> {
    match artifact {
        Some(artifact) => {
            let path = artifact.path.to_string_lossy();
            command
                .iter()
                .map(|arg| arg.replace(ARTIFACT_TOKEN, &path))
                .collect()
        }
        None => command.to_vec(),
    }
}

async fn await_startup(
    supervisor: &NodeSupervisor,
    prober: &ReadinessProber,
    config: &CassandraConfig,
) -> Result<(), CassandraError> {
    let readiness = &config.readiness;
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(readiness.min_delay())
        .with_max_delay(readiness.max_delay())
        .without_max_times();
    if readiness.jitter {
        backoff = backoff.with_jitter();
    }

    let ports = config.ports.as_slice();
    let mut last_error = None;
    let polled = tokio::time::timeout(
        readiness.startup_timeout(),
        (|| poll_readiness(supervisor, prober, ports))
            .retry(backoff)
            .when(|e: &CassandraError| e.is_retryable())
            .notify(|e: &CassandraError, delay| {
                debug!("{e}, probing again in {delay:?}");
                last_error = Some(e.to_string());
            }),
    )
    .await;

    let report = match polled {
        Ok(report) => report?,
        Err(_) => {
            return Err(CassandraError::Timeout(format!(
                "'{}' is not ready after {:?} ({})",
                config.name,
                readiness.startup_timeout(),
                last_error.as_deref().unwrap_or("no probe completed")
            )));
        }
    };
    info!("'{}:{}' is ready: {report:?}", config.name, supervisor.pid());

    if config.verify_ports {
        prober.verify_listening(&config.ports).await?;
    }
    Ok(())
}

async fn poll_readiness(
    supervisor: &NodeSupervisor,
    prober: &ReadinessProber,
    ports: &[PortSpec],
) -> Result<ReadinessReport, CassandraError> {
    if !supervisor.is_alive().await {
        let status = supervisor
            .exit_status()
            .await
            .unwrap_or(ProcessStatus::Unknown);
        return Err(CassandraError::ProcessExited {
            name: supervisor.name().to_string(),
            status,
        });
    }

    let report = prober.probe(ports).await?;
    if report.all_ready() || report.all_disabled() {
        Ok(report)
    } else {
        let pending = report.pending().collect::<Vec<_>>().join(", ");
        Err(CassandraError::NotReady(format!("waiting for {pending}")))
    }
}
