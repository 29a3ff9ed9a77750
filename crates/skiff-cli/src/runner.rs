//! Block runner that drives the sandbox's HTTP control plane.
//!
//! Each sandbox image is expected to serve:
//!
//! ```text
//! POST /blocks/{block_id}/run
//!   request:  { "blockId": "...", "sandboxId": "...", "input": <any> }
//!   response: { "success": true, "output": <any>, "error": null, "durationMs": 12 }
//! ```

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use serde::Serialize;
use serde_json::Value;
use skiff_core::{BlockOutcome, BlockRunner, RunnerError, SandboxSnapshot};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Request body sent to the sandbox.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest<'a> {
    block_id: &'a str,
    sandbox_id: &'a str,
    input: &'a Value,
}

/// Runs blocks by POSTing to `{address}/blocks/{block_id}/run`.
#[derive(Debug, Clone)]
pub struct HttpBlockRunner {
    client: Client<HttpConnector>,
    timeout: Duration,
    inputs: HashMap<String, Value>,
}

impl HttpBlockRunner {
    /// Create a runner giving each block at most `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
            inputs: HashMap::new(),
        }
    }

    /// Per-block input payloads, sent as `input`.
    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Endpoint for a block in a sandbox.
    pub fn endpoint(sandbox: &SandboxSnapshot, block_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(block_id.as_bytes()).collect();
        format!("{}/blocks/{}/run", sandbox.address, encoded)
    }

    async fn call(&self, block_id: &str, sandbox: &SandboxSnapshot) -> Result<BlockOutcome, RunnerError> {
        let body = serde_json::to_vec(&RunRequest {
            block_id,
            sandbox_id: sandbox.id.as_str(),
            input: self.inputs.get(block_id).unwrap_or(&Value::Null),
        })?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(Self::endpoint(sandbox, block_id))
            .header("Content-Type", "application/json")
            .body(Body::from(body))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&bytes);
            return Err(format!("sandbox returned {}: {}", status.as_u16(), message.trim()).into());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl BlockRunner for HttpBlockRunner {
    async fn run_block(
        &self,
        block_id: &str,
        sandbox: &SandboxSnapshot,
    ) -> Result<BlockOutcome, RunnerError> {
        let start = Instant::now();
        tracing::debug!(block_id, sandbox_id = %sandbox.id, address = %sandbox.address, "Dispatching block");

        let mut outcome = match tokio::time::timeout(self.timeout, self.call(block_id, sandbox)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(format!("block timed out after {}ms", self.timeout.as_millis()).into())
            }
        };

        if outcome.duration_ms == 0 {
            outcome.duration_ms = start.elapsed().as_millis() as u64;
        }
        tracing::debug!(
            block_id,
            success = outcome.success,
            duration_ms = outcome.duration_ms,
            "Block finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::{SandboxId, SandboxState};

    fn snapshot(port: u16) -> SandboxSnapshot {
        SandboxSnapshot {
            id: SandboxId::from("c1"),
            state: SandboxState::Running,
            block_id: Some("resize".into()),
            port,
            address: skiff_runtime::address_for(port),
            created_at: chrono::Utc::now(),
            dormant_since: None,
            dormancy_deadline: None,
            acquire_count: 0,
        }
    }

    #[test]
    fn test_endpoint_encodes_block_id() {
        let sandbox = snapshot(40001);
        assert_eq!(
            HttpBlockRunner::endpoint(&sandbox, "resize"),
            "http://localhost:40001/blocks/resize/run"
        );
        assert_eq!(
            HttpBlockRunner::endpoint(&sandbox, "a/b c"),
            "http://localhost:40001/blocks/a%2Fb+c/run"
        );
    }

    #[test]
    fn test_request_body_shape() {
        let input = serde_json::json!({"width": 64});
        let body = serde_json::to_value(RunRequest {
            block_id: "resize",
            sandbox_id: "c1",
            input: &input,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"blockId": "resize", "sandboxId": "c1", "input": {"width": 64}})
        );
    }

    #[tokio::test]
    async fn test_unreachable_sandbox_is_an_error() {
        // nothing listens on port 1
        let runner = HttpBlockRunner::new(Duration::from_secs(2));
        assert!(runner.run_block("resize", &snapshot(1)).await.is_err());
    }
}
