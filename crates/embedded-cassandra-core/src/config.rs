use crate::error::CassandraError;
use crate::process::StopSignal;
use crate::version::Version;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Where and how to fetch the server distribution for one launch.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct ArtifactRequest {
    pub version: Version,
    /// Cache directory; the archive lands at `{directory}/{file name}`
    pub directory: PathBuf,
    /// Candidate mirrors, tried in order. Empty means the Apache mirrors.
    #[builder(default)]
    #[builder(setter(custom))]
    pub urls: Vec<String>,
    #[builder(default)]
    pub proxy: Option<String>,
    #[builder(default)]
    pub connect_timeout: Option<Duration>,
    #[builder(default)]
    pub read_timeout: Option<Duration>,
}

impl ArtifactRequest {
    pub fn builder() -> ArtifactRequestBuilder {
        ArtifactRequestBuilder::default()
    }

    /// The configured URLs, or the default Apache mirrors for the version.
    pub fn candidate_urls(&self) -> Vec<String> {
        if self.urls.is_empty() {
            default_urls(&self.version)
        } else {
            self.urls.clone()
        }
    }
}

impl ArtifactRequestBuilder {
    pub fn urls<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let urls: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.urls = Some(urls);
        self
    }

    pub fn url<S: ToString>(&mut self, url: S) -> &mut Self {
        self.urls
            .get_or_insert_with(Vec::new)
            .push(url.to_string());
        self
    }
}

pub fn default_urls(version: &Version) -> Vec<String> {
    vec![
        format!(
            "https://downloads.apache.org/cassandra/{version}/apache-cassandra-{version}-bin.tar.gz"
        ),
        format!(
            "https://archive.apache.org/dist/cassandra/{version}/apache-cassandra-{version}-bin.tar.gz"
        ),
    ]
}

/// A network feature of the node and the ports it listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Logical feature name, e.g. "native transport" or "rpc"
    pub feature: String,
    pub enabled: bool,
    pub port: u16,
    #[serde(default)]
    pub ssl_port: Option<u16>,
}

impl PortSpec {
    pub fn new(feature: impl Into<String>, port: u16) -> Self {
        Self {
            feature: feature.into(),
            enabled: true,
            port,
            ssl_port: None,
        }
    }

    pub fn disabled(feature: impl Into<String>, port: u16) -> Self {
        Self {
            enabled: false,
            ..Self::new(feature, port)
        }
    }

    pub fn with_ssl_port(mut self, ssl_port: u16) -> Self {
        self.ssl_port = Some(ssl_port);
        self
    }

    /// Primary port, then the SSL port if any
    pub fn ports(&self) -> impl Iterator<Item = u16> + use<> {
        std::iter::once(self.port).chain(self.ssl_port)
    }

    pub fn validate(&self) -> Result<(), CassandraError> {
        if self.feature.trim().is_empty() {
            return Err(CassandraError::InvalidArgument(
                "port spec feature name must not be blank".to_string(),
            ));
        }
        if self.enabled && self.ports().any(|port| port == 0) {
            return Err(CassandraError::InvalidArgument(format!(
                "port spec '{}' must not use port 0",
                self.feature
            )));
        }
        Ok(())
    }
}

/// How long and how often to poll the node's listeners during startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Overall time the node gets to open its listeners (in milliseconds)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Minimum delay between probes (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between probes (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Connect timeout of a single port probe (in milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Whether to randomize probe delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            jitter: default_jitter(),
        }
    }
}

impl ReadinessConfig {
    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!(
                "min_delay_ms cannot be greater than max_delay_ms"
            ));
        }

        if self.max_delay_ms > 60_000 {
            return Err(anyhow::anyhow!("max_delay_ms should not exceed 60 seconds"));
        }

        if self.startup_timeout_ms == 0 {
            return Err(anyhow::anyhow!("startup_timeout_ms must be positive"));
        }

        if self.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("connect_timeout_ms must be positive"));
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Stop protocol settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StopConfig {
    /// Wait after each graceful stop request before escalating (in milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Signal sent by the default graceful stop
    #[serde(default)]
    pub signal: StopSignal,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            signal: StopSignal::default(),
        }
    }
}

impl StopConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Main launcher configuration
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct CassandraConfig {
    #[builder(default = "String::from(\"cassandra\")")]
    pub name: String,
    pub version: Version,
    /// Distribution to resolve before launch
    #[builder(default)]
    pub artifact: Option<ArtifactRequest>,
    /// Program and arguments. The token `{artifact}` is replaced with the
    /// resolved artifact path.
    #[builder(setter(custom))]
    pub command: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: BTreeMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub ports: Vec<PortSpec>,
    #[builder(default = "IpAddr::V4(Ipv4Addr::LOCALHOST)")]
    pub address: IpAddr,
    #[builder(default)]
    pub readiness: ReadinessConfig,
    #[builder(default)]
    pub stop: StopConfig,
    /// Check ports are free before launch and bound after startup
    #[builder(default = "true")]
    pub verify_ports: bool,
}

impl CassandraConfig {
    pub fn builder() -> CassandraConfigBuilder {
        CassandraConfigBuilder::default()
    }
}

impl CassandraConfigBuilder {
    pub fn command<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let command: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.command = Some(command);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(BTreeMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(BTreeMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn port(&mut self, spec: PortSpec) -> &mut Self {
        self.ports.get_or_insert_with(Vec::new).push(spec);
        self
    }

    pub fn ports<I: IntoIterator<Item = PortSpec>>(&mut self, iter: I) -> &mut Self {
        self.ports = Some(iter.into_iter().collect());
        self
    }

    fn validate(&self) -> Result<(), String> {
        match &self.command {
            Some(command) if command.iter().any(|arg| !arg.trim().is_empty()) => {}
            _ => return Err("command must contain a program".to_string()),
        }
        if let Some(readiness) = &self.readiness {
            readiness.validate().map_err(|e| e.to_string())?;
        }
        if let Some(ports) = &self.ports {
            for spec in ports {
                spec.validate().map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_startup_timeout_ms() -> u64 {
    90_000
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    1_000
}
fn default_connect_timeout_ms() -> u64 {
    250
}
fn default_jitter() -> bool {
    true
}
fn default_grace_period_ms() -> u64 {
    5_000
}
