//! Signal-driven shutdown of a running service.
//!
//! Kept in its own test binary: the signals are raised at the whole process.

#![cfg(unix)]

use aesd_socket::signal::SIGTERM;
use aesd_socket::{Config, LogLevel, Service, ShutdownReason};
use nix::sys::signal::{raise, Signal};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sigterm_drains_and_second_sigterm_forces() {
    let test_result = timeout(Duration::from_secs(10), async {
        let dir = tempdir().expect("Failed to create temporary directory");
        let config = Config::builder()
            .name("signals")
            .address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .data_file(dir.path().join("aesdsocketdata"))
            .sync_writes(false)
            .timestamps(false)
            .log_level(LogLevel::Error)
            .build()
            .unwrap();

        let service = Service::builder(config).bind().unwrap();
        let addr = service.local_addr();
        let data_file = service.data_file().to_path_buf();
        let coordinator = service.shutdown_coordinator();
        let monitor = service.monitor();
        let task = tokio::spawn(service.run());

        // A served request means the handlers are registered.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"hello\n");

        // This one never finishes its message.
        let _idle = TcpStream::connect(addr).await.unwrap();
        while monitor.stats().active_connections == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        raise(Signal::SIGTERM).unwrap();
        while !monitor.is_shutdown() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coordinator.shutdown_reason(), Some(ShutdownReason::Signal(SIGTERM)));

        // Graceful: the open connection keeps the service draining.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        assert!(data_file.exists());

        raise(Signal::SIGTERM).unwrap();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.reaped, 2);
        assert!(!data_file.exists());
        assert_eq!(coordinator.shutdown_reason(), Some(ShutdownReason::Signal(SIGTERM)));
    })
    .await;

    assert!(test_result.is_ok(), "Test timed out after 10 seconds");
}
