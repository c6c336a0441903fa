//! Readiness probing for freshly started workers.
//!
//! The wait loop tells two failures apart. A worker whose process has exited
//! can never become ready, so the loop fails with [`Error::Disconnected`] as
//! soon as it notices. A worker that is alive but not answering is retried at
//! a fixed interval until the budget runs out, then fails with
//! [`Error::Timeout`].

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ReadinessConfig;
use crate::error::{Error, Result};
use crate::process::ProcessHandle;
use crate::worker::{ProbeOutcome, WorkerClient};

/// Timing for one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Overall budget, fixed at entry.
    pub timeout: Duration,
    /// Pause between attempts.
    pub poll_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&ReadinessConfig::default())
    }
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Polls the worker's liveness endpoint until it answers or the budget ends.
pub async fn wait_until_alive(
    handle: &mut ProcessHandle,
    client: &WorkerClient,
    policy: &ReadinessPolicy,
) -> Result<()> {
    let deadline = Instant::now() + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        if let Some(status) = handle.try_exit_status() {
            tracing::warn!(
                pid = handle.pid(),
                status = %status,
                attempts,
                "worker exited before becoming ready"
            );
            return Err(Error::Disconnected {
                exit_code: status.code(),
                port_contended: false,
            });
        }

        attempts += 1;
        match client.check_alive().await {
            ProbeOutcome::Alive => {
                tracing::info!(url = %client.alive_url(), attempts, "worker is ready");
                return Ok(());
            }
            ProbeOutcome::NotReady(status) => {
                tracing::debug!(url = %client.alive_url(), status, "worker not ready yet");
            }
            ProbeOutcome::Unreachable(reason) => {
                tracing::debug!(url = %client.alive_url(), reason = %reason, "worker unreachable");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
    }

    // The process may have died during the final attempt
    if let Some(status) = handle.try_exit_status() {
        return Err(Error::Disconnected {
            exit_code: status.code(),
            port_contended: false,
        });
    }

    tracing::warn!(
        url = %client.alive_url(),
        attempts,
        timeout = ?policy.timeout,
        "worker readiness budget exhausted"
    );
    Err(Error::Timeout(policy.timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{self, LaunchSpec, LogBuffer};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn spawn_process(script: &str, dir: &TempDir) -> ProcessHandle {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        process::start(
            LaunchSpec {
                command: &command,
                working_dir: dir.path(),
                env: &HashMap::new(),
                log_tag: "readiness-test",
            },
            &LogBuffer::default(),
        )
        .expect("failed to start process")
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Serves `/alive`, failing with 503 for the first `failures` requests.
    fn serve_alive(listener: TcpListener, failures: usize, hits: Arc<AtomicUsize>) {
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let hit = hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let status = if hit < failures {
                    "503 Service Unavailable"
                } else {
                    "200 OK"
                };
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
    }

    fn fast_policy(timeout: Duration) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout,
            poll_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn default_policy_matches_config_defaults() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.poll_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dead_process_fails_fast_with_disconnected() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn_process("exit 7", &dir);
        let client =
            WorkerClient::for_port("127.0.0.1", free_port(), None, Duration::from_secs(2))
                .unwrap();

        let started = std::time::Instant::now();
        let err = wait_until_alive(&mut handle, &client, &fast_policy(Duration::from_secs(20)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Disconnected {
                exit_code: Some(7),
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn silent_live_process_times_out() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn_process("sleep 30", &dir);
        let client =
            WorkerClient::for_port("127.0.0.1", free_port(), None, Duration::from_secs(1))
                .unwrap();

        let started = std::time::Instant::now();
        let err = wait_until_alive(&mut handle, &client, &fast_policy(Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(1));
        handle.stop().await;
    }

    #[tokio::test]
    async fn retries_connection_failures_until_listener_appears() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn_process("sleep 30", &dir);
        let port = free_port();
        let hits = Arc::new(AtomicUsize::new(0));

        let server_hits = hits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            serve_alive(listener, 0, server_hits);
        });

        let client =
            WorkerClient::for_port("127.0.0.1", port, None, Duration::from_secs(1)).unwrap();
        let started = std::time::Instant::now();
        wait_until_alive(&mut handle, &client, &fast_policy(Duration::from_secs(10)))
            .await
            .expect("worker should become ready");

        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn non_success_status_is_retried() {
        let dir = TempDir::new().unwrap();
        let mut handle = spawn_process("sleep 30", &dir);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        serve_alive(listener, 3, hits.clone());

        let client =
            WorkerClient::for_port("127.0.0.1", port, None, Duration::from_secs(1)).unwrap();
        wait_until_alive(&mut handle, &client, &fast_policy(Duration::from_secs(10)))
            .await
            .expect("worker should become ready");

        assert_eq!(hits.load(Ordering::SeqCst), 4);
        handle.stop().await;
    }
}
