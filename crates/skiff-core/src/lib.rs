//! # skiff-core
//!
//! Sandbox pool and lane executor for Skiff workflow blocks.
//!
//! Each workflow block runs inside its own container sandbox. Starting a
//! container is slow, so this crate keeps a bounded pool of them, parks
//! released sandboxes by pausing them, wakes them for the next block, and
//! retires them once they have been dormant for too long.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    skiff-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  LaneExecutor   │────▶│  BlockRunner             │   │
//! │  │  - execute()    │     │  (run one block)         │   │
//! │  │  - abort()      │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │           │ acquire / release                            │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  SandboxPool    │────▶│  HashMap<SandboxId,      │   │
//! │  │  - prewarm()    │     │          SandboxRecord>  │   │
//! │  │  - acquire()    │     │  PortAllocator           │   │
//! │  │  - release()    │     └──────────────────────────┘   │
//! │  │  - teardown()   │                                    │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! └───────────┼──────────────────────────────────────────────┘
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        ContainerRuntime (skiff-runtime, Docker)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sandbox lifecycle
//!
//! ```text
//! starting ──▶ idle ──▶ running ──▶ dormant ──▶ idle ...
//!    │          │          │           │
//!    └──────────┴──────────┴───────────┴──▶ terminated
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use skiff_core::{ExecutionPlan, LaneExecutor, PoolConfig, SandboxPool};
//! use skiff_runtime::DockerRuntime;
//! use std::sync::Arc;
//!
//! # async fn example(runner: Arc<dyn skiff_core::BlockRunner>) -> skiff_core::Result<()> {
//! let config = PoolConfig::builder()
//!     .image("ghcr.io/acme/block-runner:latest")
//!     .max_sandboxes(4)
//!     .build()?;
//! let pool = SandboxPool::new(config, Arc::new(DockerRuntime::default()))?;
//! pool.cleanup_orphans().await;
//!
//! let plan = ExecutionPlan::new()
//!     .sequential("fetch")
//!     .parallel(["resize", "thumbnail"])
//!     .sequential("publish");
//!
//! let executor = LaneExecutor::new(pool.clone(), runner);
//! let report = executor.execute(&plan).await?;
//! for result in &report.results {
//!     println!("{}: {}", result.block_id, result.success);
//! }
//!
//! pool.teardown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Bounded Pool**: Never more than `max_sandboxes` live containers
//! - **Pause/Resume Reuse**: Released sandboxes are paused, not destroyed
//! - **Dormancy Expiry**: Paused sandboxes are retired after a timeout
//! - **Lane Scheduling**: Sequential and parallel lanes, strict or lenient
//! - **Cooperative Abort**: In-flight blocks finish, then the pool is torn down
//! - **Orphan Cleanup**: Containers left by a crashed process are removed

mod config;
mod error;
mod events;
mod executor;
mod lifecycle;
mod plan;
mod pool;
mod ports;
mod runner;
mod sandbox;

pub use config::{ParallelismModel, PoolConfig, PoolConfigBuilder};
pub use error::{CoreError, Result};
pub use events::{BroadcastSink, Event, EventSink, NoopSink, TracingSink};
pub use executor::{AbortHandle, LaneExecutor};
pub use lifecycle::{assert_transition, is_valid_transition, SandboxState};
pub use plan::{
    BlockResult, ExecutionPlan, ExecutionReport, ExecutionStatus, FailureMode, Lane, ParallelGroup,
};
pub use pool::{PoolStats, SandboxPool};
pub use ports::{PortAllocator, PortRange};
pub use runner::{BlockOutcome, BlockRunner, RunnerError};
pub use sandbox::{SandboxId, SandboxSnapshot};
