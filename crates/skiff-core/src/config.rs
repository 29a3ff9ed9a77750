//! Pool configuration types.

use crate::error::CoreError;
use crate::ports::PortRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How concurrent blocks map onto sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelismModel {
    /// One sandbox per concurrently running block.
    #[default]
    MultiSandbox,
    /// One shared sandbox, blocks multiplexed onto it.
    SingleSandbox,
}

impl ParallelismModel {
    /// Parse from string (case-insensitive), falling back to multi-sandbox.
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl fmt::Display for ParallelismModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiSandbox => write!(f, "multi-sandbox"),
            Self::SingleSandbox => write!(f, "single-sandbox"),
        }
    }
}

impl FromStr for ParallelismModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "multi-sandbox" | "multi" => Ok(Self::MultiSandbox),
            "single-sandbox" | "single" => Ok(Self::SingleSandbox),
            other => Err(format!("unknown parallelism model: {other}")),
        }
    }
}

/// Configuration for a [`SandboxPool`](crate::SandboxPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sandbox image.
    pub image: String,
    /// Port the sandbox service listens on inside the container (default: 8080).
    pub container_port: u16,
    /// Extra environment (`KEY=value`) for every sandbox.
    pub env: Vec<String>,
    /// Cap on live (non-terminated) sandboxes (default: 4).
    pub max_sandboxes: usize,
    /// Delay between health probes (default: 250ms).
    pub health_check_interval: Duration,
    /// Give up on a sandbox that is not healthy after this long (default: 30s).
    pub health_check_timeout: Duration,
    /// Paused sandboxes are terminated after this long (default: 5 minutes).
    pub dormancy_timeout: Duration,
    /// Sandbox sharing model (default: multi-sandbox).
    pub parallelism: ParallelismModel,
    /// Host ports handed to sandboxes (default: 40000-40099).
    pub ports: PortRange,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            container_port: 8080,
            env: Vec::new(),
            max_sandboxes: 4,
            health_check_interval: Duration::from_millis(250),
            health_check_timeout: Duration::from_secs(30),
            dormancy_timeout: Duration::from_secs(300),
            parallelism: ParallelismModel::MultiSandbox,
            ports: PortRange::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new config builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Sandbox cap after applying the parallelism model.
    pub fn effective_max(&self) -> usize {
        match self.parallelism {
            ParallelismModel::MultiSandbox => self.max_sandboxes,
            ParallelismModel::SingleSandbox => 1,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image.trim().is_empty() {
            return Err(CoreError::InvalidConfig("image is required".into()));
        }
        if self.max_sandboxes == 0 {
            return Err(CoreError::InvalidConfig("max_sandboxes must be > 0".into()));
        }
        if self.container_port == 0 {
            return Err(CoreError::InvalidConfig("container_port must be > 0".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(CoreError::InvalidConfig(
                "health_check_interval must be > 0".into(),
            ));
        }
        if self.health_check_timeout < self.health_check_interval {
            return Err(CoreError::InvalidConfig(
                "health_check_timeout must be >= health_check_interval".into(),
            ));
        }
        let ports = PortRange::new(self.ports.start, self.ports.end)?;
        if ports.start == 0 {
            return Err(CoreError::InvalidConfig("port range must not include 0".into()));
        }
        if ports.len() < self.effective_max() {
            return Err(CoreError::InvalidConfig(format!(
                "port range {ports} holds {} ports, fewer than max_sandboxes {}",
                ports.len(),
                self.effective_max()
            )));
        }
        Ok(())
    }
}

/// Builder for PoolConfig.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the sandbox image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set the in-container service port.
    pub fn container_port(mut self, port: u16) -> Self {
        self.config.container_port = port;
        self
    }

    /// Add an environment entry (`KEY=value`).
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.config.env.push(entry.into());
        self
    }

    /// Set the sandbox cap.
    pub fn max_sandboxes(mut self, max: usize) -> Self {
        self.config.max_sandboxes = max;
        self
    }

    /// Set the health probe interval.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set the health check timeout.
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_check_timeout = timeout;
        self
    }

    /// Set the dormancy window.
    pub fn dormancy_timeout(mut self, timeout: Duration) -> Self {
        self.config.dormancy_timeout = timeout;
        self
    }

    /// Set the parallelism model.
    pub fn parallelism(mut self, model: ParallelismModel) -> Self {
        self.config.parallelism = model;
        self
    }

    /// Set the host port range.
    pub fn ports(mut self, start: u16, end: u16) -> Self {
        self.config.ports = PortRange { start, end };
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<PoolConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
