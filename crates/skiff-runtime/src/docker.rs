//! Docker Engine API backend.
//!
//! Talks to the daemon directly over its Unix socket, the same way the Docker
//! CLI does, instead of shelling out to `docker`.

use crate::error::{Result, RuntimeError};
use crate::health::wait_healthy;
use crate::runtime::ContainerRuntime;
use crate::spec::{ContainerFilter, ContainerSpec, ContainerSummary};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default daemon socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Engine API version prefix used for every request.
const API_VERSION: &str = "v1.43";

/// Grace period handed to `POST /containers/{id}/stop`.
const STOP_TIMEOUT_SECS: u32 = 5;

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_SOCKET)
    }
}

impl DockerRuntime {
    /// Create a runtime talking to the daemon at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    /// Path of the daemon socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Ping the daemon (`GET /_ping`).
    pub async fn ping(&self) -> Result<()> {
        let (status, body) = self.send(Method::GET, "/_ping", None).await?;
        expect_success(status, &body, "daemon")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<(StatusCode, Bytes)> {
        let full_path = format!("/{API_VERSION}{path}");
        tracing::trace!(method = %method, path = %full_path, "Docker API request");

        let uri: hyper::Uri = Uri::new(&self.socket_path, &full_path).into();
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                RuntimeError::Connection(format!(
                    "cannot reach docker daemon at {}: {e}",
                    self.socket_path.display()
                ))
            } else {
                RuntimeError::Http(e)
            }
        })?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        tracing::trace!(status = %status, len = bytes.len(), "Docker API response");
        Ok((status, bytes))
    }

    async fn post_action(&self, id: &str, action: &str, query: &str) -> Result<()> {
        let path = format!("/containers/{id}/{action}{query}");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        // 304: already in the requested state (start/stop)
        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!(container_id = %id, action, "Container already in requested state");
            return Ok(());
        }
        expect_success(status, &body, id)
    }
}

/// Turn a non-success daemon response into a [`RuntimeError`].
fn expect_success(status: StatusCode, body: &[u8], id: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RuntimeError::NotFound(id.to_string()));
    }
    let message = serde_json::from_slice::<ApiErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    Err(RuntimeError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Encode the `filters` query parameter of `GET /containers/json`.
fn encode_filters(filter: &ContainerFilter) -> Result<String> {
    let mut filters: BTreeMap<&str, &[String]> = BTreeMap::new();
    if !filter.labels.is_empty() {
        filters.insert("label", &filter.labels);
    }
    let json = serde_json::to_string(&filters)?;
    Ok(url::form_urlencoded::byte_serialize(json.as_bytes()).collect())
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<&'a [String]>,
    env: &'a [String],
    labels: &'a BTreeMap<String, String>,
    exposed_ports: BTreeMap<String, EmptyObject>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
struct EmptyObject {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    port_bindings: BTreeMap<String, Vec<HostPortBinding>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostPortBinding {
    host_ip: &'static str,
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

fn create_body(spec: &ContainerSpec) -> CreateBody<'_> {
    let mut exposed_ports = BTreeMap::new();
    let mut port_bindings = BTreeMap::new();
    if let Some(port) = spec.port {
        let key = format!("{}/tcp", port.container_port);
        exposed_ports.insert(key.clone(), EmptyObject {});
        port_bindings.insert(
            key,
            vec![HostPortBinding {
                host_ip: "127.0.0.1",
                host_port: port.host_port.to_string(),
            }],
        );
    }
    CreateBody {
        image: &spec.image,
        cmd: spec.command.as_deref(),
        env: &spec.env,
        labels: &spec.labels,
        exposed_ports,
        host_config: HostConfig { port_bindings },
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let body = serde_json::to_string(&create_body(spec))?;
        let path = match &spec.name {
            Some(name) => format!(
                "/containers/create?name={}",
                url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>()
            ),
            None => "/containers/create".to_string(),
        };

        let (status, bytes) = self.send(Method::POST, &path, Some(body)).await?;
        if status == StatusCode::NOT_FOUND {
            // 404 on create means the image is missing, not the container
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                message: format!("image not found: {}", spec.image),
            });
        }
        expect_success(status, &bytes, spec.name.as_deref().unwrap_or(&spec.image))?;

        let created: CreateResponse = serde_json::from_slice(&bytes)?;
        for warning in created.warnings.iter().flatten() {
            tracing::warn!(container_id = %created.id, warning = %warning, "Docker create warning");
        }
        tracing::debug!(container_id = %created.id, image = %spec.image, "Container created");
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.post_action(id, "start", "").await
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.post_action(id, "pause", "").await
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.post_action(id, "unpause", "").await
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.post_action(id, "stop", &format!("?t={STOP_TIMEOUT_SECS}"))
            .await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let path = format!("/containers/{id}?force={force}&v=true");
        let (status, body) = self.send(Method::DELETE, &path, None).await?;
        expect_success(status, &body, id)
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let path = format!(
            "/containers/json?all={}&filters={}",
            filter.all,
            encode_filters(filter)?
        );
        let (status, body) = self.send(Method::GET, &path, None).await?;
        expect_success(status, &body, "containers")?;
        let containers: Vec<ContainerSummary> = serde_json::from_slice(&body)?;
        tracing::debug!(count = containers.len(), "Listed containers");
        Ok(containers)
    }

    async fn health_check(&self, port: u16, interval: Duration, timeout: Duration) -> Result<()> {
        wait_healthy(port, interval, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_body_service() {
        let spec = ContainerSpec::new("runner:latest")
            .publish(8080, 40001)
            .env("A=1")
            .owned();
        let json = serde_json::to_value(create_body(&spec)).unwrap();

        assert_eq!(json["Image"], "runner:latest");
        assert!(json.get("Cmd").is_none());
        assert_eq!(json["Env"][0], "A=1");
        assert_eq!(json["Labels"]["io.skiff.managed"], "true");
        assert!(json["ExposedPorts"].get("8080/tcp").is_some());
        assert_eq!(
            json["HostConfig"]["PortBindings"]["8080/tcp"][0]["HostPort"],
            "40001"
        );
    }

    #[test]
    fn test_create_body_idle() {
        let spec = ContainerSpec::new("alpine").idle();
        let json = serde_json::to_value(create_body(&spec)).unwrap();
        assert_eq!(json["Cmd"][0], "sleep");
        assert_eq!(json["Cmd"][1], "infinity");
        assert_eq!(json["ExposedPorts"], serde_json::json!({}));
    }

    #[test]
    fn test_encode_filters() {
        let encoded = encode_filters(&ContainerFilter::owned()).unwrap();
        assert_eq!(
            encoded,
            "%7B%22label%22%3A%5B%22io.skiff.managed%3Dtrue%22%5D%7D"
        );
    }

    #[test]
    fn test_expect_success_maps_errors() {
        assert!(expect_success(StatusCode::NO_CONTENT, b"", "x").is_ok());
        assert!(matches!(
            expect_success(StatusCode::NOT_FOUND, b"", "abc"),
            Err(RuntimeError::NotFound(id)) if id == "abc"
        ));
        let err = expect_success(
            StatusCode::CONFLICT,
            br#"{"message":"container is not running"}"#,
            "abc",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "runtime API error (409): container is not running"
        );
    }

    #[test]
    fn test_default_socket() {
        let runtime = DockerRuntime::default();
        assert_eq!(runtime.socket_path(), Path::new(DEFAULT_DOCKER_SOCKET));
        assert_eq!(runtime.backend_name(), "docker");
    }
}
