use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shellgate_core::{HelperBroker, HelperConfig, ShellgateError};
use tempfile::TempDir;

const LONG_RUNNING: &str = "while true; do sleep 1; done";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn ephemeral_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(binary: &Path, port_base: u16, port_range: u16) -> HelperConfig {
    HelperConfig {
        binary: binary.to_string_lossy().into_owned(),
        port_base,
        port_range,
        startup_grace_ms: 200,
        ..HelperConfig::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

mod allocation_tests {
    use super::*;

    #[test]
    fn test_allocation_skips_occupied_port() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = occupied.local_addr().unwrap().port();
        let broker = HelperBroker::new(config(Path::new("/bin/true"), base, 3));

        let port = broker.allocate_port().unwrap();
        assert_ne!(port, base);
        assert!(port > base && port < base + 3);

        let next = broker.allocate_port();
        assert_ne!(next, Some(port));
    }

    #[test]
    fn test_pool_exhaustion() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = occupied.local_addr().unwrap().port();
        let broker = HelperBroker::new(config(Path::new("/bin/true"), base, 1));

        assert_eq!(broker.allocate_port(), None);
        assert!(broker.tracked_ports().is_empty());
    }

    #[tokio::test]
    async fn test_create_reports_exhaustion() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-exhaust", LONG_RUNNING);
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = occupied.local_addr().unwrap().port();
        let broker = HelperBroker::new(config(&script, base, 1));

        let err = broker.create().await.unwrap_err();
        assert!(matches!(err, ShellgateError::PoolExhausted { .. }));
        assert!(err.is_transient());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_helper() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("sg-missing");
        let broker = HelperBroker::new(config(&missing, ephemeral_port(), 2));

        assert!(!broker.is_available());
        let err = broker.create().await.unwrap_err();
        assert_eq!(err.error_code(), "E2001");
        assert!(broker.tracked_ports().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_releases_port() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-crash", "exit 1");
        let base = ephemeral_port();
        let broker = HelperBroker::new(config(&script, base, 2));

        assert!(broker.is_available());
        let err = broker.create().await.unwrap_err();
        assert!(matches!(err, ShellgateError::SpawnFailed { .. }));
        assert!(broker.tracked_ports().is_empty());
        assert!(broker.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_start_outside_pool_is_rejected() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-range", LONG_RUNNING);
        let base = ephemeral_port();
        let broker = HelperBroker::new(config(&script, base, 2));

        let err = broker.start(base.wrapping_sub(1)).await.unwrap_err();
        assert!(matches!(err, ShellgateError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_start_list_and_stop() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-tracked", LONG_RUNNING);
        let base = ephemeral_port();
        let broker = HelperBroker::new(config(&script, base, 2));

        let launch = broker.create().await.unwrap();
        assert!(launch.pid > 0);
        assert!(launch.port >= base && launch.port < base + 2);

        let auth = launch.credential.to_auth();
        assert_eq!(auth.username, "admin");
        assert!(!auth.password.is_empty());
        assert!(!format!("{:?}", launch).contains(&auth.password));

        let active = broker.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].port, launch.port);
        assert_eq!(active[0].pid, launch.pid);
        assert!(!active[0].adopted);

        assert_eq!(broker.stop(launch.port), 1);
        assert!(broker.tracked_ports().is_empty());

        settle().await;
        assert!(broker.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_on_running_port_is_rejected() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-twice", LONG_RUNNING);
        let base = ephemeral_port();
        let broker = HelperBroker::new(config(&script, base, 1));

        let launch = broker.start(base).await.unwrap();
        let err = broker.start(base).await.unwrap_err();
        assert!(matches!(err, ShellgateError::InvalidArgument(_)));

        broker.stop(launch.port);
    }

    #[tokio::test]
    async fn test_stop_unknown_port_is_ok() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-unknown", LONG_RUNNING);
        let broker = HelperBroker::new(config(&script, ephemeral_port(), 2));

        assert_eq!(broker.stop(broker.config().port_base), 0);
    }
}

mod discovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_other_broker_adopts_and_stops_helper() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sg-adopt", LONG_RUNNING);
        let base = ephemeral_port();
        let original = HelperBroker::new(config(&script, base, 2));
        let launch = original.create().await.unwrap();

        // A broker with no history of this helper, as after a server restart.
        let restarted = HelperBroker::new(config(&script, base, 2));
        let active = restarted.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].port, launch.port);
        assert_eq!(active[0].pid, launch.pid);
        assert!(active[0].adopted);

        assert!(restarted.stop(launch.port) >= 1);
        assert!(restarted.tracked_ports().is_empty());

        settle().await;
        assert!(original.list_active().is_empty());
        assert!(original.tracked_ports().is_empty());
    }

    #[tokio::test]
    async fn test_stop_frees_port_held_by_unrelated_process() {
        let port = ephemeral_port();
        let program = format!(
            "import socket, time\n\
             s = socket.socket()\n\
             s.bind(('127.0.0.1', {}))\n\
             s.listen()\n\
             time.sleep(30)\n",
            port
        );
        // The listener has to be a process that looks nothing like the helper.
        let Ok(mut listener) = std::process::Command::new("python3")
            .arg("-c")
            .arg(&program)
            .spawn()
        else {
            return;
        };

        let mut listening = false;
        for _ in 0..100 {
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                listening = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(listening);

        let broker = HelperBroker::new(config(Path::new("/nonexistent/sg-helper"), port, 1));
        assert_eq!(broker.stop(port), 1);

        let mut exited = false;
        for _ in 0..100 {
            if listener.try_wait().unwrap().is_some() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(exited);
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
