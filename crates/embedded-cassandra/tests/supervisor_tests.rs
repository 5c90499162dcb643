use embedded_cassandra::{
    CommandStop, NodeSupervisor, ProcessHandle, RunProcess, SignalStop, StopOutcome, StopSignal,
    SupervisorState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

#[tokio::test]
async fn test_sleep_is_stopped_gracefully() {
    init_tracing();
    let runner = RunProcess::new(["sleep", "100"]);
    let (handle, output) = runner.start_with_output(|_| {}).await.unwrap();
    assert_eq!(handle.arguments(), ["sleep", "100"]);

    let supervisor = NodeSupervisor::new(
        "sleep",
        handle,
        Arc::new(SignalStop::new(StopSignal::Terminate)),
    )
    .with_output(output);
    assert!(supervisor.is_alive().await);

    let started = Instant::now();
    let outcome = supervisor.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            graceful_attempts: 1,
            forced: false
        }
    );
    assert!(!supervisor.is_alive().await);
    assert_eq!(supervisor.state().await, SupervisorState::Stopped);

    // A second stop has nothing left to do
    assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_process_ignoring_sigterm_is_destroyed() {
    init_tracing();
    let runner = RunProcess::new(["sh", "-c", "trap '' TERM; echo trapped; sleep 100"]);
    let (handle, output) = runner.start_with_output(|_| {}).await.unwrap();

    let supervisor = NodeSupervisor::new("stubborn", handle, Arc::new(SignalStop::default()))
        .with_grace_period(Duration::from_millis(300))
        .with_output(output);

    // Let the shell install its trap before the first request
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = supervisor.stop().await.unwrap();
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            graceful_attempts: 2,
            forced: true
        }
    );
    assert!(!supervisor.is_alive().await);
}

#[tokio::test]
async fn test_command_stop_substitutes_pid() {
    init_tracing();
    let runner = RunProcess::new(["sleep", "100"]);
    let (handle, output) = runner.start_with_output(|_| {}).await.unwrap();

    let stop = CommandStop::new(["sh", "-c", "kill -INT {pid}"]);
    let supervisor = NodeSupervisor::new("sleep", handle, Arc::new(stop)).with_output(output);

    let outcome = supervisor.stop().await.unwrap();
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            graceful_attempts: 1,
            forced: false
        }
    );
}

#[tokio::test]
async fn test_output_reaches_consumer_before_stop_returns() {
    init_tracing();
    let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = lines.clone();
    let runner = RunProcess::new(["sh", "-c", "echo ready; exec sleep 100"]);
    let (handle, output) = runner
        .start_with_output(move |line| sink.lock().unwrap().push(line.to_string()))
        .await
        .unwrap();

    let supervisor =
        NodeSupervisor::new("echo", handle, Arc::new(SignalStop::default())).with_output(output);
    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.stop().await.unwrap();

    assert_eq!(*lines.lock().unwrap(), vec!["ready"]);
}

#[tokio::test]
async fn test_stuck_stop_command_does_not_block_escalation() {
    init_tracing();
    let runner = RunProcess::new(["sleep", "100"]);
    let (handle, output) = runner.start_with_output(|_| {}).await.unwrap();

    let stop = CommandStop::new(["sleep", "30"]);
    let supervisor = NodeSupervisor::new("sleep", handle, Arc::new(stop))
        .with_grace_period(Duration::from_millis(200))
        .with_output(output);

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
        .await
        .expect("stop finishes in bounded time")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            graceful_attempts: 2,
            forced: true
        }
    );
    assert!(!supervisor.is_alive().await);
}
