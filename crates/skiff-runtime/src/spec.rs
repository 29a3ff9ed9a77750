//! Container creation specs, list filters and summaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label key stamped on every container Skiff creates.
pub const OWNER_LABEL_KEY: &str = "io.skiff.managed";

/// Value of [`OWNER_LABEL_KEY`] on owned containers.
pub const OWNER_LABEL_VALUE: &str = "true";

/// Command used by idle (multiplexed) sandboxes.
pub const IDLE_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// A container port published on a host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Port bound on the host loopback interface.
    pub host_port: u16,
}

/// Everything the runtime needs to create one container.
///
/// # Example
///
/// ```
/// use skiff_runtime::ContainerSpec;
///
/// let spec = ContainerSpec::new("ghcr.io/acme/block-runner:latest")
///     .name("skiff-1")
///     .publish(8080, 40000)
///     .env("RUST_LOG=info")
///     .owned();
///
/// assert_eq!(spec.port.map(|p| p.host_port), Some(40000));
/// assert!(spec.is_owned());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Optional container name.
    pub name: Option<String>,
    /// Command override; `None` keeps the image's default entrypoint.
    pub command: Option<Vec<String>>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Published service port.
    pub port: Option<PortBinding>,
}

impl ContainerSpec {
    /// Start a spec for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the command.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Run a long-lived idle command instead of the image's service.
    pub fn idle(self) -> Self {
        self.command(IDLE_COMMAND)
    }

    /// Add an environment entry (`KEY=value`).
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Publish `container_port` on the host's `host_port`.
    pub fn publish(mut self, container_port: u16, host_port: u16) -> Self {
        self.port = Some(PortBinding {
            container_port,
            host_port,
        });
        self
    }

    /// Stamp the ownership label used by orphan cleanup.
    pub fn owned(self) -> Self {
        self.label(OWNER_LABEL_KEY, OWNER_LABEL_VALUE)
    }

    /// Whether the spec carries the ownership label.
    pub fn is_owned(&self) -> bool {
        self.labels.get(OWNER_LABEL_KEY).map(String::as_str) == Some(OWNER_LABEL_VALUE)
    }
}

/// Filter for [`ContainerRuntime::list_containers`](crate::ContainerRuntime::list_containers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Label selectors, `key=value` or bare `key`.
    pub labels: Vec<String>,
    /// Include stopped containers.
    pub all: bool,
}

impl ContainerFilter {
    /// Every container (running or not) carrying the ownership label.
    pub fn owned() -> Self {
        Self {
            labels: vec![format!("{OWNER_LABEL_KEY}={OWNER_LABEL_VALUE}")],
            all: true,
        }
    }

    /// Add a `key=value` label selector.
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push(format!("{key}={value}"));
        self
    }

    /// Check a label map against the selectors.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|selector| match selector.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(selector.as_str()),
        })
    }
}

/// A container as reported by the runtime's list call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    /// Runtime-assigned id.
    pub id: String,
    /// Names (Docker prefixes them with `/`).
    #[serde(default)]
    pub names: Vec<String>,
    /// Image reference.
    #[serde(default)]
    pub image: String,
    /// Coarse state (`running`, `paused`, `exited`, ...).
    #[serde(default)]
    pub state: String,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
