//! Readiness probing: a single health check, a polling loop bounded by a
//! deadline, and a pre-spawn check for something already listening.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("not ready after {attempts} attempts within {deadline:?}")]
    Timeout { deadline: Duration, attempts: u32 },
}

#[derive(Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    url: String,
    deadline: Duration,
    interval: Duration,
}

impl ReadinessProbe {
    /// `attempt_timeout` bounds each request; `deadline` bounds the whole poll.
    pub fn new(
        url: impl Into<String>,
        attempt_timeout: Duration,
        deadline: Duration,
        interval: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            deadline,
            interval,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One attempt. Only a 200 counts; anything else means "not yet".
    pub async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                tracing::trace!(url = %self.url, status = %resp.status(), "Health check not ready");
                false
            }
            Err(e) => {
                tracing::trace!(url = %self.url, "Health check failed: {}", e);
                false
            }
        }
    }

    /// Poll until a 200 or the deadline. Returns the number of attempts made.
    pub async fn wait_until_ready(&self) -> Result<u32, ProbeError> {
        let started = Instant::now();
        let mut attempts = 0u32;
        let poll = async {
            loop {
                attempts += 1;
                if self.check().await {
                    return;
                }
                tokio::time::sleep(self.interval).await;
            }
        };

        let result = tokio::time::timeout(self.deadline, poll).await;
        match result {
            Ok(()) => {
                tracing::debug!(
                    url = %self.url,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Service is ready"
                );
                Ok(attempts)
            }
            Err(_) => Err(ProbeError::Timeout {
                deadline: self.deadline,
                attempts,
            }),
        }
    }
}

/// Whether something already accepts TCP connections on `host:port`.
pub async fn port_in_use(host: &str, port: u16, timeout: Duration) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode as HttpStatus, routing::get, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Health endpoint that answers 503 for the first `fail_first` calls.
    async fn serve_health(fail_first: u32) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                "/health",
                get(|State((calls, fail_first)): State<(Arc<AtomicU32>, u32)>| async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n > fail_first {
                        HttpStatus::OK
                    } else {
                        HttpStatus::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state((calls.clone(), fail_first));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}/health", addr), calls)
    }

    fn unused_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn ready_after_two_failed_polls() {
        let (url, calls) = serve_health(2).await;
        let probe = ReadinessProbe::new(
            url,
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .unwrap();

        assert_eq!(probe.wait_until_ready().await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_ready_times_out() {
        let (url, _calls) = serve_health(u32::MAX).await;
        let deadline = Duration::from_millis(400);
        let interval = Duration::from_millis(50);
        let probe = ReadinessProbe::new(url, Duration::from_secs(1), deadline, interval).unwrap();

        let started = std::time::Instant::now();
        let err = probe.wait_until_ready().await.unwrap_err();
        assert!(started.elapsed() < deadline + interval + Duration::from_millis(200));
        let ProbeError::Timeout { attempts, .. } = err;
        assert!(attempts >= 2);
    }

    #[tokio::test]
    async fn connection_refused_is_retried_not_fatal() {
        let url = format!("http://127.0.0.1:{}/health", unused_port());
        let probe = ReadinessProbe::new(
            url,
            Duration::from_millis(200),
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(!probe.check().await);
        assert!(matches!(probe.wait_until_ready().await, Err(ProbeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn port_probe_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use("127.0.0.1", port, Duration::from_millis(500)).await);
        drop(listener);
        assert!(!port_in_use("127.0.0.1", unused_port(), Duration::from_millis(500)).await);
    }
}
