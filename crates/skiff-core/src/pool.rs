//! Bounded sandbox pool with pause/resume reuse.
//!
//! Sandboxes are expensive to start but cheap to keep paused, so a released
//! sandbox is parked (`dormant`) instead of destroyed and woken again by the
//! next acquirer. A dormant sandbox nobody wakes is terminated once its
//! dormancy window runs out.
//!
//! # Architecture
//!
//! ```text
//! SandboxPool (Arc<PoolInner>)
//! ├─ Mutex<PoolState>
//! │   ├─ records: HashMap<SandboxId, SandboxRecord>
//! │   ├─ ports: PortAllocator
//! │   └─ pending_spawns            (counted against the cap)
//! ├─ runtime: Arc<dyn ContainerRuntime>
//! └─ dormancy timers               (one tokio task per dormant record,
//!                                   holding only a Weak<PoolInner>)
//! ```
//!
//! The state lock is never held across a runtime call. Every
//! select-then-mutate step (pick an idle record, mark it running) happens in
//! a single lock scope, and records with an in-flight wake or terminate are
//! skipped by selection.
//!
//! # Example
//!
//! ```ignore
//! use skiff_core::{PoolConfig, SandboxPool};
//! use skiff_runtime::DockerRuntime;
//! use std::sync::Arc;
//!
//! let config = PoolConfig::builder()
//!     .image("ghcr.io/acme/block-runner:latest")
//!     .max_sandboxes(4)
//!     .build()?;
//! let pool = SandboxPool::new(config, Arc::new(DockerRuntime::default()))?;
//!
//! pool.cleanup_orphans().await;
//! pool.prewarm(2).await?;
//!
//! let sandbox = pool.acquire("resize").await?;
//! // ... run the block against sandbox.address ...
//! pool.release(&sandbox.id).await?;
//!
//! pool.teardown().await;
//! ```

use crate::config::{ParallelismModel, PoolConfig};
use crate::error::{CoreError, Result};
use crate::events::{Event, EventSink, NoopSink};
use crate::lifecycle::SandboxState;
use crate::ports::PortAllocator;
use crate::sandbox::{DormancyTimer, SandboxId, SandboxRecord, SandboxSnapshot};
use chrono::Utc;
use futures::future::join_all;
use skiff_runtime::{ContainerFilter, ContainerRuntime, ContainerSpec};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Statistics
// ============================================================================

/// Pool statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Acquires served by an idle sandbox.
    pub idle_hits: AtomicU64,
    /// Acquires served by waking a dormant sandbox.
    pub wakes: AtomicU64,
    /// Wake attempts that failed.
    pub wake_failures: AtomicU64,
    /// Acquires that had to start a new sandbox.
    pub cold_starts: AtomicU64,
    /// Sandboxes that reached `idle` after spawning.
    pub spawned: AtomicU64,
    /// Sandboxes terminated.
    pub terminated: AtomicU64,
}

impl PoolStats {
    /// Get the number of idle hits.
    pub fn idle_hits(&self) -> u64 {
        self.idle_hits.load(Ordering::Relaxed)
    }

    /// Get the number of successful wakes.
    pub fn wakes(&self) -> u64 {
        self.wakes.load(Ordering::Relaxed)
    }

    /// Get the number of failed wakes.
    pub fn wake_failures(&self) -> u64 {
        self.wake_failures.load(Ordering::Relaxed)
    }

    /// Get the number of cold starts.
    pub fn cold_starts(&self) -> u64 {
        self.cold_starts.load(Ordering::Relaxed)
    }

    /// Get the total sandboxes spawned.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Get the total sandboxes terminated.
    pub fn terminated(&self) -> u64 {
        self.terminated.load(Ordering::Relaxed)
    }

    /// Share of acquires served without a cold start, as a percentage.
    pub fn reuse_rate(&self) -> f64 {
        let reused = (self.idle_hits() + self.wakes()) as f64;
        let total = reused + self.cold_starts() as f64;
        if total == 0.0 {
            0.0
        } else {
            (reused / total) * 100.0
        }
    }
}

// ============================================================================
// Pool Implementation
// ============================================================================

/// In-flight operation that owns a record until it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Waking,
    Terminating,
}

struct PoolState {
    records: HashMap<SandboxId, SandboxRecord>,
    ports: PortAllocator,
    pending_spawns: usize,
    ops: HashMap<SandboxId, PendingOp>,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.records.values().filter(|r| r.is_live()).count()
    }

    /// Live sandboxes plus spawns that have not produced a record yet.
    fn occupancy(&self) -> usize {
        self.live_count() + self.pending_spawns
    }

    fn pending(&self, id: &SandboxId) -> Option<PendingOp> {
        self.ops.get(id).copied()
    }

    /// Reserve a spawn slot if the cap allows it.
    fn reserve_spawn(&mut self, max: usize) -> bool {
        if self.occupancy() < max {
            self.pending_spawns += 1;
            true
        } else {
            false
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<PoolState>,
    /// Serialises creation of the shared sandbox in single-sandbox mode.
    single_gate: Mutex<()>,
    events: Arc<dyn EventSink>,
    stats: PoolStats,
    timer_generation: AtomicU64,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for record in self.state.get_mut().records.values_mut() {
            record.cancel_dormancy();
        }
    }
}

/// What an acquirer picked while holding the lock.
enum Pick {
    Bound(SandboxSnapshot),
    Wake { id: SandboxId, port: u16 },
    Spawn,
    Full,
}

/// Which container spec a spawn uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnKind {
    /// Runs the image's service and publishes its port.
    Service,
    /// Runs an idle command; work is multiplexed onto it out-of-band.
    Shared,
}

/// A bounded pool of sandboxes.
///
/// Cloning is cheap and yields another handle to the same pool. The pool is
/// owned by whoever created it; there is no global instance.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("backend", &self.inner.runtime.backend_name())
            .field("max_sandboxes", &self.inner.config.effective_max())
            .field("parallelism", &self.inner.config.parallelism)
            .finish()
    }
}

impl SandboxPool {
    /// Create a pool that discards events.
    pub fn new(config: PoolConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        Self::with_events(config, runtime, Arc::new(NoopSink))
    }

    /// Create a pool publishing lifecycle transitions to `events`.
    pub fn with_events(
        config: PoolConfig,
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let ports = PortAllocator::new(config.ports)?;
        tracing::info!(
            backend = runtime.backend_name(),
            max_sandboxes = config.effective_max(),
            parallelism = %config.parallelism,
            ports = %config.ports,
            "Creating sandbox pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    records: HashMap::new(),
                    ports,
                    pending_spawns: 0,
                    ops: HashMap::new(),
                }),
                single_gate: Mutex::new(()),
                events,
                stats: PoolStats::default(),
                timer_generation: AtomicU64::new(0),
                runtime,
                config,
            }),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the pool statistics.
    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Number of non-terminated sandboxes.
    pub async fn live_count(&self) -> usize {
        self.inner.state.lock().await.live_count()
    }

    /// Free ports left in the configured range.
    pub async fn available_ports(&self) -> usize {
        self.inner.state.lock().await.ports.available()
    }

    /// Read-only copies of every record, oldest first.
    pub async fn snapshot(&self) -> Vec<SandboxSnapshot> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<_> = state.records.values().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// Read-only copy of one record.
    pub async fn get(&self, id: &SandboxId) -> Option<SandboxSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .records
            .get(id)
            .map(|r| r.snapshot())
    }

    // ------------------------------------------------------------------------
    // Prewarm
    // ------------------------------------------------------------------------

    /// Start up to `count` sandboxes concurrently, without exceeding the cap.
    ///
    /// Every spawn runs to completion; if any failed, the first error is
    /// returned after the others settle and the successful ones stay pooled.
    ///
    /// # Returns
    ///
    /// The number of sandboxes started.
    pub async fn prewarm(&self, count: usize) -> Result<usize> {
        let _gate = match self.inner.config.parallelism {
            ParallelismModel::SingleSandbox => Some(self.inner.single_gate.lock().await),
            ParallelismModel::MultiSandbox => None,
        };
        let kind = self.spawn_kind();
        let max = self.inner.config.effective_max();

        let reserved = {
            let mut state = self.inner.state.lock().await;
            let n = count.min(max.saturating_sub(state.occupancy()));
            state.pending_spawns += n;
            n
        };
        if reserved == 0 {
            tracing::debug!(requested = count, "Pool already at capacity, nothing to prewarm");
            return Ok(0);
        }

        tracing::info!(requested = count, spawning = reserved, "Prewarming sandboxes");
        let results = join_all((0..reserved).map(|_| self.spawn(kind, None))).await;

        let mut started = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Prewarm spawn failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(started, "Prewarm complete");
                Ok(started)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Acquire / release
    // ------------------------------------------------------------------------

    /// Bind a sandbox to `block_id`.
    ///
    /// Multi-sandbox mode prefers an idle sandbox, then wakes a dormant one,
    /// then spawns a new one if the cap allows. Single-sandbox mode always
    /// hands out the one shared sandbox.
    ///
    /// # Errors
    ///
    /// [`CoreError::NoSandboxAvailable`] when nothing can be reused or
    /// spawned, or the spawn error if a needed spawn failed.
    pub async fn acquire(&self, block_id: &str) -> Result<SandboxSnapshot> {
        match self.inner.config.parallelism {
            ParallelismModel::MultiSandbox => self.acquire_exclusive(block_id).await,
            ParallelismModel::SingleSandbox => self.acquire_shared(block_id).await,
        }
    }

    async fn acquire_exclusive(&self, block_id: &str) -> Result<SandboxSnapshot> {
        let max = self.inner.config.effective_max();

        let pick = {
            let mut state = self.inner.state.lock().await;
            let idle = state
                .records
                .values()
                .find(|r| r.selectable(SandboxState::Idle) && state.pending(&r.id).is_none())
                .map(|r| r.id.clone());
            let dormant = state
                .records
                .values()
                .find(|r| r.selectable(SandboxState::Dormant) && state.pending(&r.id).is_none())
                .map(|r| (r.id.clone(), r.port));

            if let Some(id) = idle {
                let record = state
                    .records
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(id.clone()))?;
                Pick::Bound(self.bind(record, block_id)?)
            } else if let Some((id, port)) = dormant {
                state.ops.insert(id.clone(), PendingOp::Waking);
                if let Some(record) = state.records.get_mut(&id) {
                    record.busy = true;
                    record.cancel_dormancy();
                    record.dormant_since = None;
                }
                Pick::Wake { id, port }
            } else if state.reserve_spawn(max) {
                Pick::Spawn
            } else {
                Pick::Full
            }
        };

        let wake_error = match pick {
            Pick::Bound(snapshot) => {
                self.inner.stats.idle_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(sandbox_id = %snapshot.id, block_id, "Acquired idle sandbox");
                return Ok(snapshot);
            }
            Pick::Spawn => return self.cold_start(block_id).await,
            Pick::Full => return Err(CoreError::NoSandboxAvailable { max }),
            Pick::Wake { id, port } => match self.wake(&id, port, block_id).await {
                Ok(snapshot) => {
                    self.inner.stats.wakes.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(sandbox_id = %id, block_id, "Acquired woken sandbox");
                    return Ok(snapshot);
                }
                Err(e) => e,
            },
        };

        // The failed sandbox must be fully gone (stopped, removed, port
        // returned) before a replacement is spawned.
        self.inner.stats.wake_failures.fetch_add(1, Ordering::Relaxed);
        if let CoreError::WakeFailed { id, reason } = &wake_error {
            tracing::warn!(sandbox_id = %id, reason = %reason, "Wake failed, replacing sandbox");
            if let Err(e) = self.terminate(id).await {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to terminate unwakeable sandbox");
            }
        }

        let reserved = self.inner.state.lock().await.reserve_spawn(max);
        if reserved {
            self.cold_start(block_id).await
        } else {
            Err(wake_error)
        }
    }

    async fn cold_start(&self, block_id: &str) -> Result<SandboxSnapshot> {
        self.inner.stats.cold_starts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(block_id, "No reusable sandbox, performing cold start");
        self.spawn(SpawnKind::Service, Some(block_id)).await
    }

    async fn acquire_shared(&self, block_id: &str) -> Result<SandboxSnapshot> {
        let _gate = self.inner.single_gate.lock().await;

        let existing = {
            let state = self.inner.state.lock().await;
            state
                .records
                .values()
                .find(|r| r.is_live() && state.pending(&r.id).is_none())
                .map(|r| r.id.clone())
        };

        let id = match existing {
            Some(id) => id,
            None => {
                if !self.inner.state.lock().await.reserve_spawn(1) {
                    return Err(CoreError::NoSandboxAvailable { max: 1 });
                }
                self.inner.stats.cold_starts.fetch_add(1, Ordering::Relaxed);
                self.spawn(SpawnKind::Shared, None).await?.id
            }
        };

        let mut state = self.inner.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        if record.state == SandboxState::Idle {
            let from = record.transition(SandboxState::Running)?;
            record.block_id = Some(block_id.to_string());
            self.emit_transition(record, from);
        } else {
            self.inner.stats.idle_hits.fetch_add(1, Ordering::Relaxed);
            record.block_id = Some(block_id.to_string());
        }
        record.acquire_count += 1;
        tracing::debug!(
            sandbox_id = %id,
            block_id,
            acquire_count = record.acquire_count,
            "Acquired shared sandbox"
        );
        Ok(record.snapshot())
    }

    /// Give a sandbox back to the pool.
    ///
    /// Multi-sandbox mode pauses it and starts its dormancy timer; if the
    /// pause fails the sandbox is terminated and the error returned.
    /// Single-sandbox mode only drops one binder.
    pub async fn release(&self, id: &SandboxId) -> Result<()> {
        match self.inner.config.parallelism {
            ParallelismModel::MultiSandbox => self.release_exclusive(id).await,
            ParallelismModel::SingleSandbox => self.release_shared(id).await,
        }
    }

    async fn release_exclusive(&self, id: &SandboxId) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            let record = state
                .records
                .get(id)
                .ok_or_else(|| CoreError::NotFound(id.clone()))?;
            if state.pending(id) == Some(PendingOp::Terminating) {
                tracing::debug!(sandbox_id = %id, "Release of sandbox being terminated");
                return Ok(());
            }
            crate::lifecycle::assert_transition(record.state, SandboxState::Dormant)?;
        }

        if let Err(e) = self.inner.runtime.pause_container(id.as_str()).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Pause failed, terminating sandbox");
            if let Err(te) = self.terminate(id).await {
                tracing::warn!(sandbox_id = %id, error = %te, "Failed to terminate unpausable sandbox");
            }
            return Err(CoreError::runtime("pause", e));
        }

        let mut state = self.inner.state.lock().await;
        let terminating = state.pending(id).is_some();
        let Some(record) = state.records.get_mut(id) else {
            return Err(CoreError::NotFound(id.clone()));
        };
        if record.state != SandboxState::Running || terminating {
            // terminated while we were pausing it
            return Ok(());
        }

        let block_id = record.block_id.take();
        let from = record.transition(SandboxState::Dormant)?;
        record.dormant_since = Some(Utc::now());
        self.arm_dormancy(record);
        self.emit_transition(record, from);
        tracing::debug!(
            sandbox_id = %id,
            block_id = block_id.as_deref().unwrap_or_default(),
            "Sandbox released and paused"
        );
        Ok(())
    }

    async fn release_shared(&self, id: &SandboxId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        if !record.is_live() {
            return Ok(());
        }
        record.acquire_count = record.acquire_count.saturating_sub(1);
        if record.acquire_count == 0 {
            record.block_id = None;
        }
        tracing::debug!(
            sandbox_id = %id,
            acquire_count = record.acquire_count,
            "Shared sandbox released"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Terminate / teardown / orphans
    // ------------------------------------------------------------------------

    /// Stop, remove and forget a sandbox. Idempotent.
    ///
    /// Stop and remove failures are logged and ignored (the container may
    /// already be gone); the port is always returned to the allocator.
    pub async fn terminate(&self, id: &SandboxId) -> Result<()> {
        let port = {
            let mut state = self.inner.state.lock().await;
            let pending = state.pending(id);
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(id.clone()))?;
            if !record.is_live() || pending == Some(PendingOp::Terminating) {
                return Ok(());
            }
            record.busy = true;
            record.cancel_dormancy();
            let port = record.port;
            state.ops.insert(id.clone(), PendingOp::Terminating);
            port
        };
        self.finish_terminate(id, port).await
    }

    async fn finish_terminate(&self, id: &SandboxId, port: u16) -> Result<()> {
        tracing::debug!(sandbox_id = %id, port, "Terminating sandbox");
        self.stop_and_remove(id.as_str()).await;

        let mut state = self.inner.state.lock().await;
        state.ports.release(port);
        state.ops.remove(id);
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        record.block_id = None;
        record.acquire_count = 0;
        record.dormant_since = None;
        record.busy = false;
        let from = record.transition(SandboxState::Terminated)?;
        self.emit_transition(record, from);
        self.inner.stats.terminated.fetch_add(1, Ordering::Relaxed);
        tracing::info!(sandbox_id = %id, port, "Sandbox terminated");
        Ok(())
    }

    /// Terminate every live sandbox concurrently. Safe to call repeatedly.
    pub async fn teardown(&self) {
        let ids: Vec<SandboxId> = {
            let state = self.inner.state.lock().await;
            state
                .records
                .values()
                .filter(|r| r.is_live())
                .map(|r| r.id.clone())
                .collect()
        };

        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "Tearing down sandbox pool");

        let results = join_all(ids.iter().map(|id| self.terminate(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to terminate sandbox during teardown");
            }
        }

        tracing::info!(
            terminated = self.inner.stats.terminated(),
            reuse_rate = format!("{:.1}%", self.inner.stats.reuse_rate()),
            "Pool teardown complete"
        );
    }

    /// Remove containers left behind by a previous process.
    ///
    /// Lists every container carrying the ownership label that this pool
    /// does not know about and force-removes it. Listing and removal failures
    /// are logged and skipped.
    ///
    /// # Returns
    ///
    /// The number of containers removed.
    pub async fn cleanup_orphans(&self) -> usize {
        let containers = match self
            .inner
            .runtime
            .list_containers(&ContainerFilter::owned())
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list containers, skipping orphan cleanup");
                return 0;
            }
        };

        let known: HashSet<String> = {
            let state = self.inner.state.lock().await;
            state
                .records
                .values()
                .filter(|r| r.is_live())
                .map(|r| r.id.as_str().to_string())
                .collect()
        };

        let orphans: Vec<String> = containers
            .into_iter()
            .map(|c| c.id)
            .filter(|id| !known.contains(id))
            .collect();
        if orphans.is_empty() {
            return 0;
        }

        tracing::info!(count = orphans.len(), "Removing orphaned sandboxes");
        let removed = join_all(orphans.iter().map(|id| async move {
            if let Err(e) = self.inner.runtime.stop_container(id).await {
                tracing::debug!(container_id = %id, error = %e, "Orphan stop failed");
            }
            match self.inner.runtime.remove_container(id, true).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(container_id = %id, error = %e, "Orphan remove failed");
                    false
                }
            }
        }))
        .await;

        removed.into_iter().filter(|ok| *ok).count()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn spawn_kind(&self) -> SpawnKind {
        match self.inner.config.parallelism {
            ParallelismModel::MultiSandbox => SpawnKind::Service,
            ParallelismModel::SingleSandbox => SpawnKind::Shared,
        }
    }

    fn container_spec(&self, kind: SpawnKind, port: u16) -> ContainerSpec {
        let config = &self.inner.config;
        let mut spec = ContainerSpec::new(&config.image)
            .name(format!("skiff-{}", Uuid::new_v4().simple()))
            .publish(config.container_port, port)
            .env(format!("SKIFF_PORT={}", config.container_port))
            .owned();
        for entry in &config.env {
            spec = spec.env(entry.clone());
        }
        match kind {
            SpawnKind::Service => spec,
            SpawnKind::Shared => spec.idle(),
        }
    }

    /// Start one sandbox. The caller must have reserved a spawn slot.
    ///
    /// With `bind` set the sandbox goes straight on to `running` within the
    /// same lock scope that makes it `idle`, so no other acquirer can take it.
    async fn spawn(&self, kind: SpawnKind, bind: Option<&str>) -> Result<SandboxSnapshot> {
        let start = std::time::Instant::now();

        let port = {
            let mut state = self.inner.state.lock().await;
            match state.ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    state.pending_spawns -= 1;
                    return Err(e);
                }
            }
        };

        let spec = self.container_spec(kind, port);
        tracing::debug!(port, image = %spec.image, ?kind, "Creating sandbox container");
        let id = match self.inner.runtime.create_container(&spec).await {
            Ok(id) => SandboxId::new(id),
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                state.ports.release(port);
                state.pending_spawns -= 1;
                tracing::error!(port, error = %e, "Sandbox creation failed");
                return Err(CoreError::runtime("create", e));
            }
        };

        {
            let mut state = self.inner.state.lock().await;
            state.pending_spawns -= 1;
            state
                .records
                .insert(id.clone(), SandboxRecord::new(id.clone(), port));
        }
        tracing::debug!(sandbox_id = %id, port, "Sandbox container created");

        if let Err(e) = self.inner.runtime.start_container(id.as_str()).await {
            tracing::error!(sandbox_id = %id, error = %e, "Sandbox start failed");
            self.discard(&id).await;
            return Err(CoreError::runtime("start", e));
        }

        if kind == SpawnKind::Service {
            let config = &self.inner.config;
            if let Err(e) = self
                .inner
                .runtime
                .health_check(port, config.health_check_interval, config.health_check_timeout)
                .await
            {
                tracing::error!(sandbox_id = %id, port, error = %e, "Sandbox never became healthy");
                self.discard(&id).await;
                return Err(CoreError::runtime("health_check", e));
            }
        }

        let mut state = self.inner.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        let from = record.transition(SandboxState::Idle)?;
        self.emit_transition(record, from);
        self.inner.stats.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            sandbox_id = %id,
            port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox ready"
        );

        match bind {
            Some(block_id) => self.bind(record, block_id),
            None => Ok(record.snapshot()),
        }
    }

    async fn discard(&self, id: &SandboxId) {
        if let Err(e) = self.terminate(id).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to discard sandbox");
        }
    }

    /// Unpause a claimed dormant sandbox, re-check its health and bind it.
    async fn wake(&self, id: &SandboxId, port: u16, block_id: &str) -> Result<SandboxSnapshot> {
        let wake_failed = |reason: String| CoreError::WakeFailed {
            id: id.clone(),
            reason,
        };
        tracing::debug!(sandbox_id = %id, port, "Waking dormant sandbox");

        self.inner
            .runtime
            .unpause_container(id.as_str())
            .await
            .map_err(|e| wake_failed(format!("unpause failed: {e}")))?;

        let config = &self.inner.config;
        self.inner
            .runtime
            .health_check(port, config.health_check_interval, config.health_check_timeout)
            .await
            .map_err(|e| wake_failed(format!("health check failed: {e}")))?;

        let mut state = self.inner.state.lock().await;
        if state.pending(id) != Some(PendingOp::Waking) {
            return Err(wake_failed("terminated during wake".into()));
        }
        state.ops.remove(id);
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        record.busy = false;
        let from = record.transition(SandboxState::Idle)?;
        self.emit_transition(record, from);
        self.bind(record, block_id)
    }

    /// `idle -> running` with `block_id` bound. Caller holds the lock.
    fn bind(&self, record: &mut SandboxRecord, block_id: &str) -> Result<SandboxSnapshot> {
        let from = record.transition(SandboxState::Running)?;
        record.block_id = Some(block_id.to_string());
        self.emit_transition(record, from);
        Ok(record.snapshot())
    }

    /// Schedule auto-termination of a record that just became dormant.
    fn arm_dormancy(&self, record: &mut SandboxRecord) {
        record.cancel_dormancy();
        let timeout = self.inner.config.dormancy_timeout;
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let id = record.id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            SandboxPool { inner }.expire(&id, generation).await;
        });

        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        record.dormancy = Some(DormancyTimer::new(deadline, generation, handle));
    }

    /// Dormancy timer fired. Runs unattended, so failures are only logged.
    async fn expire(&self, id: &SandboxId, generation: u64) {
        let port = {
            let mut state = self.inner.state.lock().await;
            let pending = state.pending(id);
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            let current = record.dormancy.as_ref().map(|t| t.generation);
            if record.state != SandboxState::Dormant
                || pending.is_some()
                || current != Some(generation)
            {
                return;
            }
            if let Some(timer) = record.dormancy.take() {
                timer.disarm();
            }
            record.busy = true;
            let port = record.port;
            state.ops.insert(id.clone(), PendingOp::Terminating);
            port
        };

        tracing::info!(sandbox_id = %id, "Dormancy window elapsed, terminating sandbox");
        if let Err(e) = self.finish_terminate(id, port).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Dormancy termination failed");
        }
    }

    async fn stop_and_remove(&self, id: &str) {
        let runtime = &self.inner.runtime;
        if let Err(e) = runtime.stop_container(id).await {
            if e.is_not_found() {
                tracing::debug!(sandbox_id = %id, "Container already gone on stop");
            } else {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to stop sandbox");
            }
        }
        if let Err(e) = runtime.remove_container(id, true).await {
            if e.is_not_found() {
                tracing::debug!(sandbox_id = %id, "Container already gone on remove");
            } else {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to remove sandbox");
            }
        }
    }

    fn emit_transition(&self, record: &SandboxRecord, from: SandboxState) {
        tracing::debug!(
            sandbox_id = %record.id,
            from = %from,
            to = %record.state,
            "Sandbox transition"
        );
        self.inner.events.emit(&Event::SandboxTransition {
            id: record.id.clone(),
            from,
            to: record.state,
            block_id: record.block_id.clone(),
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
