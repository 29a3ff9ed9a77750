//! The container runtime contract consumed by the sandbox pool.

use crate::error::Result;
use crate::spec::{ContainerFilter, ContainerSpec, ContainerSummary};
use async_trait::async_trait;
use std::time::Duration;

/// Thin binding over a container daemon.
///
/// Every method is a suspension point for the caller. Implementations must be
/// safe to call concurrently for distinct containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name for logs.
    fn backend_name(&self) -> &'static str;

    /// Create (but do not start) a container; returns the runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Freeze every process in the container.
    async fn pause_container(&self, id: &str) -> Result<()>;

    /// Resume a paused container.
    async fn unpause_container(&self, id: &str) -> Result<()>;

    /// Stop the container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove the container, killing it first when `force` is set.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// List containers matching `filter`.
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Poll the sandbox's health endpoint on `port` every `interval` until it
    /// answers or `timeout` elapses.
    async fn health_check(&self, port: u16, interval: Duration, timeout: Duration) -> Result<()>;
}
