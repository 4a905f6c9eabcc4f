// Integration tests supervising real OS processes
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;
use warden::config::{ProcessSpec, SupervisorSettings};
use warden::process::{ProcessEvent, Supervisor, TokioLauncher};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn shell_spec(name: &str, script: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "/bin/sh");
    spec.args = vec!["-c".to_string(), script.to_string()];
    spec.restart_intervals_ms = vec![100];
    spec
}

fn test_settings(grace_period: Duration) -> SupervisorSettings {
    SupervisorSettings {
        grace_period,
        usage_poll_interval: ms(100),
        output_drain_timeout: ms(200),
        ..SupervisorSettings::default()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ProcessEvent>,
    want: impl Fn(&ProcessEvent) -> bool,
) -> ProcessEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll a log file until it contains `needle`
async fn wait_for_log(path: &Path, needle: &str) -> String {
    for _ in 0..100 {
        let contents = fs::read_to_string(path).unwrap_or_default();
        if contents.contains(needle) {
            return contents;
        }
        tokio::time::sleep(ms(50)).await;
    }
    panic!(
        "log {} never contained {:?}: {:?}",
        path.display(),
        needle,
        fs::read_to_string(path).unwrap_or_default()
    );
}

#[tokio::test]
async fn test_output_is_captured_to_log() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("api.log");

    let supervisor = Supervisor::builder()
        .settings(test_settings(Duration::from_secs(3)))
        .build();

    let mut spec = shell_spec(
        "api",
        r"printf '\033[1mbold\033[0m\n'; echo oops >&2; exec sleep 30",
    );
    spec.log_path = Some(log_path.clone());
    spec.prefix_lines = true;

    let mut started = supervisor.start(spec).await.unwrap();
    assert!(started.info.running);

    let contents = wait_for_log(&log_path, "[api] oops").await;
    assert!(contents.contains("[api] bold\n"), "log was {:?}", contents);
    assert!(!contents.contains('\u{1b}'));

    timeout(Duration::from_secs(5), supervisor.stop_by_name("api").wait())
        .await
        .unwrap();
    wait_for(&mut started.events, |e| *e == ProcessEvent::Stopped).await;
    assert!(supervisor.info("api").await.is_none());
}

#[tokio::test]
async fn test_crashing_process_is_restarted() {
    let supervisor = Supervisor::builder()
        .settings(test_settings(Duration::from_secs(3)))
        .build();

    let mut started = supervisor
        .start(shell_spec("crashy", "exit 3"))
        .await
        .unwrap();
    let first_pid = started.info.pid.unwrap();

    let exit = wait_for(&mut started.events, |e| matches!(e, ProcessEvent::Exit { .. })).await;
    assert_eq!(
        exit,
        ProcessEvent::Exit {
            status: "exited with code 3".to_string(),
            pid: Some(first_pid)
        }
    );
    wait_for(&mut started.events, |e| *e == ProcessEvent::Restart).await;
    wait_for(&mut started.events, |e| matches!(e, ProcessEvent::Started { .. })).await;

    timeout(Duration::from_secs(5), supervisor.stop_by_name("crashy").wait())
        .await
        .unwrap();
    assert!(supervisor.list().await.is_empty());
}

#[tokio::test]
async fn test_process_ignoring_sigterm_is_killed() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("stubborn.log");

    let supervisor = Supervisor::builder()
        .settings(test_settings(ms(300)))
        .build();

    let mut spec = shell_spec(
        "stubborn",
        "trap '' TERM; echo ready; while true; do sleep 1; done",
    );
    spec.log_path = Some(log_path.clone());
    let mut started = supervisor.start(spec).await.unwrap();
    wait_for_log(&log_path, "ready").await;

    let began = Instant::now();
    timeout(Duration::from_secs(5), supervisor.stop_by_name("stubborn").wait())
        .await
        .unwrap();
    assert!(began.elapsed() >= ms(300));

    let exit = wait_for(&mut started.events, |e| matches!(e, ProcessEvent::Exit { .. })).await;
    match exit {
        ProcessEvent::Exit { status, .. } => assert_eq!(status, "terminated by signal 9"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_interpreted_script_gets_control_channel() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("worker.js");
    let log_path = dir.path().join("worker.log");
    fs::write(
        &script,
        "echo \"name=$WARDEN_PROCESS_NAME supervised=$WARDEN_SUPERVISED\"\n\
         read line\n\
         echo \"control $line\"\n\
         exit 0\n",
    )
    .unwrap();

    // The shell stands in for the script runtime
    let supervisor = Supervisor::builder()
        .launcher(TokioLauncher::with_interpreter("/bin/sh"))
        .settings(test_settings(Duration::from_secs(5)))
        .build();

    let mut spec = ProcessSpec::new("worker", &script);
    spec.log_path = Some(log_path.clone());
    let mut started = supervisor.start(spec).await.unwrap();
    wait_for_log(&log_path, "name=worker supervised=1").await;

    let began = Instant::now();
    timeout(Duration::from_secs(5), supervisor.stop_by_name("worker").wait())
        .await
        .unwrap();
    assert!(began.elapsed() < Duration::from_secs(4));

    let exit = wait_for(&mut started.events, |e| matches!(e, ProcessEvent::Exit { .. })).await;
    assert!(matches!(exit, ProcessEvent::Exit { ref status, .. } if status == "exited with code 0"));
    wait_for_log(&log_path, r#"control {"type":"shutdown"}"#).await;
}

#[tokio::test]
async fn test_memory_ceiling_triggers_restart() {
    let supervisor = Supervisor::builder()
        .settings(test_settings(Duration::from_secs(3)))
        .build();

    let mut spec = shell_spec("hungry", "exec sleep 30");
    spec.memory_threshold_bytes = Some(1);
    let mut started = supervisor.start(spec).await.unwrap();
    let first_pid = started.info.pid.unwrap();

    let breach = wait_for(&mut started.events, |e| {
        matches!(e, ProcessEvent::MemoryExceeded { .. })
    })
    .await;
    match breach {
        ProcessEvent::MemoryExceeded { usage, threshold } => {
            assert_eq!(threshold, 1);
            assert!(usage > 1);
        }
        other => panic!("unexpected event {:?}", other),
    }

    wait_for(&mut started.events, |e| *e == ProcessEvent::Restart).await;
    let relaunched = wait_for(&mut started.events, |e| matches!(e, ProcessEvent::Started { .. })).await;
    assert_ne!(relaunched, ProcessEvent::Started { pid: first_pid });

    timeout(Duration::from_secs(5), supervisor.stop_by_name("hungry").wait())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_executable_keeps_retrying() {
    let supervisor = Supervisor::builder()
        .settings(test_settings(Duration::from_secs(3)))
        .build();

    let mut spec = ProcessSpec::new("ghost", "/nonexistent/warden/ghost");
    spec.restart_intervals_ms = vec![50];
    let mut started = supervisor.start(spec).await.unwrap();
    assert!(!started.info.running);

    for _ in 0..2 {
        let error = wait_for(&mut started.events, |e| matches!(e, ProcessEvent::Error { .. })).await;
        assert!(matches!(error, ProcessEvent::Error { ref message } if message.contains("does not exist")));
    }

    timeout(ms(500), supervisor.stop_by_name("ghost").wait())
        .await
        .unwrap();
    assert!(supervisor.info("ghost").await.is_none());
}

#[tokio::test]
async fn test_shutdown_stops_every_process() {
    let supervisor = Supervisor::builder()
        .settings(test_settings(Duration::from_secs(3)))
        .build();

    for name in ["one", "two", "three"] {
        supervisor
            .start(shell_spec(name, "exec sleep 30"))
            .await
            .unwrap();
    }
    assert_eq!(supervisor.list().await.len(), 3);

    timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .unwrap();
    assert!(supervisor.list().await.is_empty());
}
