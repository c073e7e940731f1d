//! Liveness checks against an instance's HTTP gateway.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::Instant;

/// Host the gateway ports are published on, from this process's view.
pub const LOCAL_HOST: &str = "127.0.0.1";

#[derive(Clone)]
pub struct LivenessProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl LivenessProbe {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            host: host.into(),
            path: path.into(),
        })
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }

    /// Whether the gateway answers at all. Any HTTP response counts,
    /// 404 and 5xx included; only connection failures and timeouts do not.
    pub async fn check(&self, port: u16, timeout: Duration) -> bool {
        let url = self.url(port);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => {
                tracing::debug!(url = %url, status = response.status().as_u16(), "Liveness response");
                true
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Liveness check failed");
                false
            }
        }
    }

    /// Poll until the gateway answers or `max_wait` elapses.
    pub async fn wait_until_ready(&self, port: u16, interval: Duration, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let request_timeout = interval.max(Duration::from_secs(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.check(port, request_timeout).await {
                tracing::info!(port, attempts, "Gateway is reachable");
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(port, attempts, "Gateway readiness wait exhausted");
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}
