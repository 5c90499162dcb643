use embedded_cassandra_core::{CassandraError, PortSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Listener state of one feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every configured port accepts connections
    Ready,
    /// At least one configured port does not accept connections yet
    Pending,
    /// The feature is turned off; its ports are not inspected
    Disabled,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => f.write_str("ready"),
            Readiness::Pending => f.write_str("pending"),
            Readiness::Disabled => f.write_str("disabled"),
        }
    }
}

/// Result of one probe, keyed by feature name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadinessReport {
    features: BTreeMap<String, Readiness>,
}

impl ReadinessReport {
    pub fn get(&self, feature: &str) -> Option<Readiness> {
        self.features.get(feature).copied()
    }

    /// No enabled feature is pending
    pub fn all_ready(&self) -> bool {
        self.features.values().all(|r| *r != Readiness::Pending)
    }

    pub fn all_disabled(&self) -> bool {
        self.features.values().all(|r| *r == Readiness::Disabled)
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .filter(|(_, r)| **r == Readiness::Pending)
            .map(|(feature, _)| feature.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Readiness)> {
        self.features.iter().map(|(feature, r)| (feature.as_str(), *r))
    }
}

/// Stateless TCP probe of a node's listeners. Every call opens its own
/// sockets, so one prober can be shared between concurrent callers.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    address: IpAddr,
    connect_timeout: Duration,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl ReadinessProber {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Probes every feature. Not being ready is a value, not an error; only
    /// malformed specs fail.
    pub async fn probe(&self, specs: &[PortSpec]) -> Result<ReadinessReport, CassandraError> {
        validate(specs)?;

        let mut features = BTreeMap::new();
        for spec in specs {
            let readiness = if !spec.enabled {
                Readiness::Disabled
            } else if self.all_accept(spec).await {
                Readiness::Ready
            } else {
                Readiness::Pending
            };
            debug!(feature = %spec.feature, %readiness, "Probed");
            features.insert(spec.feature.clone(), readiness);
        }
        Ok(ReadinessReport { features })
    }

    /// Fails with `PortConflict` if any enabled port can be bound, meaning the
    /// node is not listening there.
    pub async fn verify_listening(&self, specs: &[PortSpec]) -> Result<(), CassandraError> {
        validate(specs)?;
        for spec in specs.iter().filter(|spec| spec.enabled) {
            for port in spec.ports() {
                if TcpListener::bind(self.socket(port)).await.is_ok() {
                    return Err(CassandraError::PortConflict {
                        feature: spec.feature.clone(),
                        port,
                        reason: format!("nothing is listening on {}", self.socket(port)),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fails with `PortConflict` if any enabled port is already taken.
    pub async fn ensure_ports_free(&self, specs: &[PortSpec]) -> Result<(), CassandraError> {
        validate(specs)?;
        for spec in specs.iter().filter(|spec| spec.enabled) {
            for port in spec.ports() {
                if let Err(e) = TcpListener::bind(self.socket(port)).await {
                    return Err(CassandraError::PortConflict {
                        feature: spec.feature.clone(),
                        port,
                        reason: format!("{} is not available: {e}", self.socket(port)),
                    });
                }
            }
        }
        Ok(())
    }

    async fn all_accept(&self, spec: &PortSpec) -> bool {
        for port in spec.ports() {
            if !self.accepts(port).await {
                return false;
            }
        }
        true
    }

    async fn accepts(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.socket(port))).await,
            Ok(Ok(_))
        )
    }

    fn socket(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.address, port)
    }
}

fn validate(specs: &[PortSpec]) -> Result<(), CassandraError> {
    let mut seen = BTreeSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.feature.as_str()) {
            return Err(CassandraError::InvalidArgument(format!(
                "feature '{}' is configured more than once",
                spec.feature
            )));
        }
    }
    Ok(())
}
