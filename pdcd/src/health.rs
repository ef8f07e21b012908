//! Health-check gate for rollback verification.
//!
//! Polls an HTTP health endpoint at a fixed interval until it answers
//! 2xx or a hard deadline passes. The outcome is a boolean; callers
//! decide whether a failed check blocks further action.

use std::time::{Duration, Instant};
use tracing::debug;

/// Default pause between probe attempts.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Health probe settings.
#[derive(Debug, Clone)]
pub struct HealthProbeConfig {
    /// Endpoint expected to answer 2xx when the service is healthy.
    pub url: String,
    /// Pause between attempts.
    pub interval: Duration,
    /// Timeout applied to each individual request.
    pub request_timeout: Duration,
}

impl HealthProbeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            interval: DEFAULT_PROBE_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Poll the endpoint until it reports healthy or `timeout` elapses.
///
/// Bounded retry loop with a hard deadline; a zero timeout returns
/// `false` without probing.
pub async fn probe_until_healthy(config: &HealthProbeConfig, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check_once(config.url.clone(), config.request_timeout).await {
            return true;
        }
        debug!(url = %config.url, "health probe attempt failed");
        tokio::time::sleep(config.interval).await;
    }
    false
}

/// One probe attempt. The blocking HTTP client runs on the blocking
/// pool so the control loop's task is never stalled.
async fn check_once(url: String, request_timeout: Duration) -> bool {
    let result = tokio::task::spawn_blocking(move || {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(request_timeout))
            .build()
            .new_agent();
        match agent.get(&url).call() {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    })
    .await;
    result.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};

    async fn serve_health() -> String {
        let app = Router::new().route("/health", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn probe_succeeds_against_healthy_endpoint() {
        let url = serve_health().await;
        let config = HealthProbeConfig {
            interval: Duration::from_millis(50),
            ..HealthProbeConfig::new(url)
        };
        assert!(probe_until_healthy(&config, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn probe_times_out_against_dead_endpoint() {
        let config = HealthProbeConfig {
            interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(100),
            ..HealthProbeConfig::new("http://127.0.0.1:1/health")
        };
        let started = Instant::now();
        assert!(!probe_until_healthy(&config, Duration::from_millis(300)).await);
        // Hard deadline, not an unbounded wait.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn zero_timeout_fails_without_probing() {
        let config = HealthProbeConfig::new("http://127.0.0.1:1/health");
        assert!(!probe_until_healthy(&config, Duration::ZERO).await);
    }
}
