//! HTTP health polling for sandbox control-plane endpoints.
//!
//! A freshly started (or unpaused) sandbox needs a moment before its service
//! answers. [`wait_healthy`] retries `GET /health` on the host port until the
//! sandbox responds with a 2xx status or the overall timeout elapses.

use crate::error::{Result, RuntimeError};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use std::time::{Duration, Instant};

/// Path polled on every sandbox.
pub const HEALTH_PATH: &str = "/health";

/// Upper bound for a single probe, so one hung connection cannot eat the
/// whole timeout budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Control-plane address for a host port.
pub fn address_for(port: u16) -> String {
    format!("http://localhost:{port}")
}

/// Poll `http://localhost:<port>/health` until it succeeds or `timeout` elapses.
///
/// # Errors
///
/// Returns [`RuntimeError::HealthTimeout`] if no probe succeeded in time.
pub async fn wait_healthy(port: u16, interval: Duration, timeout: Duration) -> Result<()> {
    let client: Client<HttpConnector> = Client::new();
    let url = format!("{}{}", address_for(port), HEALTH_PATH);
    let start = Instant::now();
    tracing::debug!(port, url = %url, "Waiting for sandbox health endpoint");

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe(&client, &url).await {
            Ok(()) => {
                tracing::debug!(
                    port,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox healthy"
                );
                return Ok(());
            }
            Err(e) => {
                if start.elapsed() >= timeout {
                    tracing::warn!(
                        port,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Sandbox health check timed out"
                    );
                    return Err(RuntimeError::HealthTimeout { port, timeout });
                }
                tracing::trace!(port, attempt = attempts, error = %e, "Health probe failed, retrying...");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

async fn probe(client: &Client<HttpConnector>, url: &str) -> Result<()> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Body::empty())?;

    let response = match tokio::time::timeout(PROBE_TIMEOUT, client.request(request)).await {
        Ok(response) => response?,
        Err(_) => return Err(RuntimeError::Connection("health probe timed out".into())),
    };

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message: "health endpoint not ready".into(),
        })
    }
}
