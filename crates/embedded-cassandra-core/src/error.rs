use crate::process::{ProcessId, ProcessStatus};
use crate::version::Version;
use thiserror::Error;

/// One failed attempt to fetch an artifact from a candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionAttempt {
    pub url: String,
    pub cause: String,
}

/// Core error types for embedded Cassandra operations
#[derive(Error, Debug)]
pub enum CassandraError {
    #[error("{}", describe_attempts(.version, .attempts))]
    Resolution {
        version: Version,
        attempts: Vec<ResolutionAttempt>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{name}:{pid}' has not been stopped and is still running")]
    Shutdown { name: String, pid: ProcessId },

    #[error("Port {port} ({feature}) conflict: {reason}")]
    PortConflict {
        feature: String,
        port: u16,
        reason: String,
    },

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("'{name}' exited before it became ready ({status:?})")]
    ProcessExited { name: String, status: ProcessStatus },

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CassandraError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, CassandraError::NotReady(_))
    }
}

fn describe_attempts(version: &Version, attempts: &[ResolutionAttempt]) -> String {
    let mut message = format!(
        "Could not download Apache Cassandra ({version}) from {} URL(s)",
        attempts.len()
    );
    for attempt in attempts {
        message.push_str(&format!("\n  - {}: {}", attempt.url, attempt.cause));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_lists_every_attempt() {
        let error = CassandraError::Resolution {
            version: Version::new(4, 1, 3),
            attempts: vec![
                ResolutionAttempt {
                    url: "http://a/x.tar.gz".to_string(),
                    cause: "HTTP 404".to_string(),
                },
                ResolutionAttempt {
                    url: "http://b/x.tar.gz".to_string(),
                    cause: "connection refused".to_string(),
                },
            ],
        };
        let display = error.to_string();
        assert!(display.contains("4.1.3"));
        assert!(display.contains("2 URL(s)"));
        assert!(display.contains("http://a/x.tar.gz: HTTP 404"));
        assert!(display.contains("http://b/x.tar.gz: connection refused"));
    }

    #[test]
    fn test_shutdown_error_names_process() {
        let error = CassandraError::Shutdown {
            name: "cassandra".to_string(),
            pid: 4242,
        };
        assert!(error.to_string().contains("'cassandra:4242'"));
    }

    #[test]
    fn test_error_categorization() {
        assert!(CassandraError::NotReady("native".to_string()).is_retryable());
        assert!(!CassandraError::Timeout("90s".to_string()).is_retryable());
        assert!(!CassandraError::InvalidArgument("x".to_string()).is_retryable());
        assert!(
            !CassandraError::Shutdown {
                name: "n".to_string(),
                pid: 1
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_io_conversion() {
        let error: CassandraError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into();
        assert!(matches!(error, CassandraError::Io(_)));
        assert!(format!("{error:?}").contains("Io"));
    }
}
