//! # skiff-runtime
//!
//! Container runtime layer for Skiff sandboxes.
//!
//! The sandbox pool in `skiff-core` only needs a narrow set of daemon
//! operations (create, start, pause, unpause, stop, remove, list) and a way to
//! wait for a sandbox's service to come up. This crate defines that contract
//! as the [`ContainerRuntime`] trait and ships a Docker Engine API backend.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skiff_runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
//! use std::time::Duration;
//!
//! # async fn example() -> skiff_runtime::Result<()> {
//! let docker = DockerRuntime::default();
//!
//! let spec = ContainerSpec::new("ghcr.io/acme/block-runner:latest")
//!     .publish(8080, 40000)
//!     .owned();
//!
//! let id = docker.create_container(&spec).await?;
//! docker.start_container(&id).await?;
//! docker
//!     .health_check(40000, Duration::from_millis(250), Duration::from_secs(30))
//!     .await?;
//!
//! // Park it, wake it, throw it away
//! docker.pause_container(&id).await?;
//! docker.unpause_container(&id).await?;
//! docker.stop_container(&id).await?;
//! docker.remove_container(&id, true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Engine API over Unix socket**: no dependency on the `docker` CLI
//! - **Ownership labels**: every owned container can be found again after a crash
//! - **Health polling**: retry `GET /health` until the sandbox answers

mod docker;
mod error;
mod health;
mod runtime;
mod spec;

pub use docker::{DockerRuntime, DEFAULT_DOCKER_SOCKET};
pub use error::{Result, RuntimeError};
pub use health::{address_for, wait_healthy, HEALTH_PATH};
pub use runtime::ContainerRuntime;
pub use spec::{
    ContainerFilter, ContainerSpec, ContainerSummary, PortBinding, IDLE_COMMAND, OWNER_LABEL_KEY,
    OWNER_LABEL_VALUE,
};
