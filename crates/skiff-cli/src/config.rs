//! Configuration for the skiff binary.
//!
//! Configuration is loaded from environment variables with sensible defaults;
//! command-line flags override individual values afterwards.

use skiff_core::{CoreError, ParallelismModel, PoolConfig};
use skiff_runtime::DEFAULT_DOCKER_SOCKET;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the skiff binary.
#[derive(Debug, Clone)]
pub struct SkiffConfig {
    /// Docker daemon socket.
    pub docker_socket: PathBuf,

    /// Sandbox image (required).
    pub image: String,

    /// Port the block service listens on inside the sandbox (default: 8080).
    pub container_port: u16,

    /// Extra `KEY=value` entries passed to every sandbox.
    pub sandbox_env: Vec<String>,

    /// Maximum live sandboxes (default: 4).
    pub max_sandboxes: usize,

    /// Health probe interval in milliseconds (default: 250).
    pub health_check_interval_ms: u64,

    /// Health check budget in milliseconds (default: 30000).
    pub health_check_timeout_ms: u64,

    /// Dormant sandboxes are terminated after this many milliseconds
    /// (default: 300000).
    pub dormancy_timeout_ms: u64,

    /// Sandbox sharing model (default: multi-sandbox).
    pub parallelism: ParallelismModel,

    /// First host port handed to sandboxes (default: 40000).
    pub port_range_start: u16,

    /// Last host port handed to sandboxes (default: 40099).
    pub port_range_end: u16,

    /// Sandboxes started before the first plan runs (default: 0).
    pub prewarm: usize,

    /// Upper bound for one block run in milliseconds (default: 300000).
    pub block_timeout_ms: u64,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no sandbox image configured (set SKIFF_IMAGE or --image)")]
    MissingImage,

    #[error("docker socket not found: {0}")]
    MissingSocket(PathBuf),

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error(transparent)]
    Pool(#[from] CoreError),
}

impl Default for SkiffConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            image: String::new(),
            container_port: 8080,
            sandbox_env: Vec::new(),
            max_sandboxes: 4,
            health_check_interval_ms: 250,
            health_check_timeout_ms: 30_000,
            dormancy_timeout_ms: 300_000,
            parallelism: ParallelismModel::MultiSandbox,
            port_range_start: 40000,
            port_range_end: 40099,
            prewarm: 0,
            block_timeout_ms: 300_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SkiffConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SKIFF_DOCKER_SOCKET` | `/var/run/docker.sock` |
    /// | `SKIFF_IMAGE` | (none) |
    /// | `SKIFF_CONTAINER_PORT` | `8080` |
    /// | `SKIFF_SANDBOX_ENV` | (none), comma separated `KEY=value` |
    /// | `SKIFF_MAX_SANDBOXES` | `4` |
    /// | `SKIFF_HEALTH_CHECK_INTERVAL_MS` | `250` |
    /// | `SKIFF_HEALTH_CHECK_TIMEOUT_MS` | `30000` |
    /// | `SKIFF_DORMANCY_TIMEOUT_MS` | `300000` |
    /// | `SKIFF_PARALLELISM` | `multi-sandbox` (multi-sandbox, single-sandbox) |
    /// | `SKIFF_PORT_RANGE_START` | `40000` |
    /// | `SKIFF_PORT_RANGE_END` | `40099` |
    /// | `SKIFF_PREWARM` | `0` |
    /// | `SKIFF_BLOCK_TIMEOUT_MS` | `300000` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            docker_socket: std::env::var("SKIFF_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.docker_socket),
            image: std::env::var("SKIFF_IMAGE").unwrap_or(default.image),
            container_port: env_parse("SKIFF_CONTAINER_PORT").unwrap_or(default.container_port),
            sandbox_env: std::env::var("SKIFF_SANDBOX_ENV")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(default.sandbox_env),
            max_sandboxes: env_parse("SKIFF_MAX_SANDBOXES").unwrap_or(default.max_sandboxes),
            health_check_interval_ms: env_parse("SKIFF_HEALTH_CHECK_INTERVAL_MS")
                .unwrap_or(default.health_check_interval_ms),
            health_check_timeout_ms: env_parse("SKIFF_HEALTH_CHECK_TIMEOUT_MS")
                .unwrap_or(default.health_check_timeout_ms),
            dormancy_timeout_ms: env_parse("SKIFF_DORMANCY_TIMEOUT_MS")
                .unwrap_or(default.dormancy_timeout_ms),
            parallelism: std::env::var("SKIFF_PARALLELISM")
                .map(|v| ParallelismModel::parse(&v))
                .unwrap_or(default.parallelism),
            port_range_start: env_parse("SKIFF_PORT_RANGE_START")
                .unwrap_or(default.port_range_start),
            port_range_end: env_parse("SKIFF_PORT_RANGE_END").unwrap_or(default.port_range_end),
            prewarm: env_parse("SKIFF_PREWARM").unwrap_or(default.prewarm),
            block_timeout_ms: env_parse("SKIFF_BLOCK_TIMEOUT_MS")
                .unwrap_or(default.block_timeout_ms),
        }
    }

    /// Per-block run timeout.
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Build the pool configuration.
    pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingImage);
        }
        if self.port_range_start > self.port_range_end {
            return Err(ConfigError::InvalidPortRange {
                start: self.port_range_start,
                end: self.port_range_end,
            });
        }

        let mut builder = PoolConfig::builder()
            .image(&self.image)
            .container_port(self.container_port)
            .max_sandboxes(self.max_sandboxes)
            .health_check_interval(Duration::from_millis(self.health_check_interval_ms))
            .health_check_timeout(Duration::from_millis(self.health_check_timeout_ms))
            .dormancy_timeout(Duration::from_millis(self.dormancy_timeout_ms))
            .parallelism(self.parallelism)
            .ports(self.port_range_start, self.port_range_end);
        for entry in &self.sandbox_env {
            builder = builder.env(entry.clone());
        }
        Ok(builder.build()?)
    }

    /// Validate the configuration and that the docker socket exists.
    ///
    /// Call this at startup to get clear error messages before any container
    /// is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool_config()?;
        if !self.docker_socket.exists() {
            return Err(ConfigError::MissingSocket(self.docker_socket.clone()));
        }
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration problem");
        }
        if self.prewarm > self.max_sandboxes {
            tracing::warn!(
                prewarm = self.prewarm,
                max_sandboxes = self.max_sandboxes,
                "Prewarm count exceeds the sandbox cap and will be clamped"
            );
        }
        if self.parallelism == ParallelismModel::SingleSandbox && self.max_sandboxes > 1 {
            tracing::warn!(
                max_sandboxes = self.max_sandboxes,
                "Single-sandbox mode ignores max_sandboxes"
            );
        }
    }
}
