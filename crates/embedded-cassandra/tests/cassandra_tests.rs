use embedded_cassandra::{
    ArtifactRequest, CassandraConfig, CassandraError, CassandraLayer, PortSpec, Readiness,
    ReadinessConfig, StopConfig, StopOutcome, Version,
};
use std::time::Duration;
use tokio::net::TcpListener;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

fn fast_readiness(startup_timeout_ms: u64) -> ReadinessConfig {
    ReadinessConfig {
        startup_timeout_ms,
        min_delay_ms: 20,
        max_delay_ms: 100,
        ..Default::default()
    }
}

fn fast_stop() -> StopConfig {
    StopConfig {
        grace_period_ms: 500,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_node_without_ports_starts_and_stops() {
    init_tracing();
    let config = CassandraConfig::builder()
        .name("node")
        .version(Version::new(4, 1, 3))
        .command(["sleep", "100"])
        .stop(fast_stop())
        .build()
        .unwrap();

    let node = CassandraLayer::new(config).unwrap().start().await.unwrap();
    assert!(node.is_alive().await);
    assert!(node.pid() > 0);
    assert!(node.artifact().is_none());

    let outcome = node.stop().await.unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped { forced: false, .. }));
    assert!(!node.is_alive().await);
}

#[tokio::test]
async fn test_node_is_ready_once_its_ports_accept() {
    init_tracing();
    // Stands in for the node's native transport listener
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = CassandraConfig::builder()
        .version(Version::new(4, 1, 3))
        .command(["sleep", "100"])
        .port(PortSpec::new("native transport", port))
        .port(PortSpec::disabled("rpc", 9160))
        .readiness(fast_readiness(5_000))
        .stop(fast_stop())
        .verify_ports(false)
        .build()
        .unwrap();

    let node = CassandraLayer::new(config).unwrap().start().await.unwrap();
    let report = node.probe().await.unwrap();
    assert_eq!(report.get("native transport"), Some(Readiness::Ready));
    assert_eq!(report.get("rpc"), Some(Readiness::Disabled));
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_that_never_listens_times_out_and_is_stopped() {
    init_tracing();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = CassandraConfig::builder()
        .version(Version::new(4, 1, 3))
        .command(["sleep", "100"])
        .port(PortSpec::new("native transport", port))
        .readiness(fast_readiness(400))
        .stop(fast_stop())
        .build()
        .unwrap();

    let err = CassandraLayer::new(config)
        .unwrap()
        .start()
        .await
        .err()
        .unwrap();
    match err {
        CassandraError::Timeout(message) => assert!(message.contains("native transport")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_node_that_exits_fails_fast() {
    init_tracing();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = CassandraConfig::builder()
        .name("crashing")
        .version(Version::new(4, 1, 3))
        .command(["sh", "-c", "echo 'cannot start'; exit 3"])
        .port(PortSpec::new("native transport", port))
        .readiness(fast_readiness(30_000))
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let err = CassandraLayer::new(config)
        .unwrap()
        .start()
        .await
        .err()
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    match err {
        CassandraError::ProcessExited { name, status } => {
            assert_eq!(name, "crashing");
            assert_eq!(status.exit_code(), Some(3));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_taken_port_is_a_conflict_before_launch() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = CassandraConfig::builder()
        .version(Version::new(4, 1, 3))
        .command(["sleep", "100"])
        .port(PortSpec::new("native transport", port))
        .build()
        .unwrap();

    let err = CassandraLayer::new(config)
        .unwrap()
        .start()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CassandraError::PortConflict { port: p, .. } if p == port));
}

#[tokio::test]
async fn test_resolved_artifact_is_passed_to_the_command() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let cache = tempfile::tempdir().unwrap();
    let artifact = ArtifactRequest::builder()
        .version(Version::new(4, 1, 3))
        .directory(cache.path())
        .url(format!(
            "{}/dist/apache-cassandra-4.1.3-bin.tar.gz",
            server.uri()
        ))
        .build()
        .unwrap();

    // Only keeps running if it was handed a non-empty file
    let config = CassandraConfig::builder()
        .version(Version::new(4, 1, 3))
        .artifact(artifact)
        .command(["sh", "-c", "test -s \"$0\" && exec sleep 100", "{artifact}"])
        .readiness(fast_readiness(5_000))
        .stop(fast_stop())
        .build()
        .unwrap();

    let node = CassandraLayer::new(config).unwrap().start().await.unwrap();
    let artifact = node.artifact().unwrap();
    assert_eq!(
        artifact.path,
        cache.path().join("apache-cassandra-4.1.3-bin.tar.gz")
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.is_alive().await);
    node.stop().await.unwrap();
}
