//! Lane executor: runs an [`ExecutionPlan`] against a [`SandboxPool`].
//!
//! Lanes run strictly in order. A sequential lane runs one block; a parallel
//! lane runs one tokio task per block and joins them all before the next lane
//! starts. Every block follows the same discipline:
//!
//! ```text
//! acquire ──▶ run (errors and panics caught) ──▶ release (always)
//! ```
//!
//! so a failing runner can never leak a sandbox.
//!
//! [`LaneExecutor::abort`] is cooperative: it sets a flag consulted before
//! each lane and before each task spawn. Work already in flight runs to
//! completion and releases its sandbox; the pool is then torn down.

use crate::error::{CoreError, Result};
use crate::events::{Event, EventSink, NoopSink};
use crate::plan::{BlockResult, ExecutionPlan, ExecutionReport, ExecutionStatus, FailureMode, Lane};
use crate::pool::SandboxPool;
use crate::runner::BlockRunner;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Cloneable handle that aborts the executor it came from.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Request a cooperative abort.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a single lane ended.
enum LaneOutcome {
    /// Every block of the lane was dispatched and settled.
    Finished,
    /// Abort stopped dispatch part-way through the lane.
    Interrupted,
}

/// Runs execution plans lane by lane.
pub struct LaneExecutor {
    pool: SandboxPool,
    runner: Arc<dyn BlockRunner>,
    events: Arc<dyn EventSink>,
    aborted: AbortHandle,
}

impl std::fmt::Debug for LaneExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneExecutor")
            .field("pool", &self.pool)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl LaneExecutor {
    /// Create an executor that discards events.
    pub fn new(pool: SandboxPool, runner: Arc<dyn BlockRunner>) -> Self {
        Self {
            pool,
            runner,
            events: Arc::new(NoopSink),
            aborted: AbortHandle {
                flag: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Publish lane and block events to `events`.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The pool this executor draws from.
    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Request a cooperative abort. Sticky: later executions abort at once.
    pub fn abort(&self) {
        tracing::warn!("Abort requested");
        self.aborted.abort();
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_aborted()
    }

    /// Handle for aborting from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.aborted.clone()
    }

    /// Run `plan` to completion, halt or abort.
    ///
    /// # Errors
    ///
    /// Only [`CoreError::InvalidPlan`], for a malformed plan or one whose
    /// parallelism model differs from the pool's. Block failures are
    /// reported in the returned [`ExecutionReport`].
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<ExecutionReport> {
        plan.validate()?;
        let pool_model = self.pool.config().parallelism;
        if plan.parallelism_model != pool_model {
            return Err(CoreError::InvalidPlan(format!(
                "plan expects {} but the pool runs {}",
                plan.parallelism_model, pool_model
            )));
        }

        let execution_id = Uuid::new_v4();
        let start = Instant::now();
        tracing::info!(
            %execution_id,
            lanes = plan.lanes.len(),
            blocks = plan.block_count(),
            failure_mode = ?plan.failure_mode,
            "Executing plan"
        );
        self.events.emit(&Event::ExecutionStarted {
            execution_id,
            lanes: plan.lanes.len(),
        });

        let mut results = Vec::with_capacity(plan.block_count());
        let mut lanes_completed = 0;
        let mut status = ExecutionStatus::Completed;

        for (index, lane) in plan.lanes.iter().enumerate() {
            if self.is_aborted() {
                status = self.finish_abort(index, results.len()).await;
                break;
            }

            let block_ids = lane.block_ids();
            self.events.emit(&Event::LaneStarted {
                lane: index,
                block_ids: block_ids.clone(),
                parallel: lane.is_parallel(),
                merge_strategy: match lane {
                    Lane::Parallel(group) => group.merge_strategy.clone(),
                    Lane::Sequential(_) => None,
                },
            });
            tracing::debug!(lane = index, blocks = ?block_ids, "Lane started");

            let (lane_results, outcome) = match lane {
                Lane::Sequential(block_id) => (
                    vec![run_block(self.pool.clone(), self.runner.clone(), block_id.clone()).await],
                    LaneOutcome::Finished,
                ),
                Lane::Parallel(group) => self.run_parallel(&group.block_ids).await,
            };

            for failed in lane_results.iter().filter(|r| !r.success) {
                self.events.emit(&Event::BlockError {
                    lane: index,
                    block_id: failed.block_id.clone(),
                    error: failed.error.clone().unwrap_or_default(),
                });
            }
            let first_failure = lane_results
                .iter()
                .find(|r| !r.success)
                .map(|r| r.block_id.clone());
            let failed = lane_results.iter().filter(|r| !r.success).count();
            let succeeded = lane_results.len() - failed;
            results.extend(lane_results);

            if let LaneOutcome::Interrupted = outcome {
                status = self.finish_abort(index, results.len()).await;
                break;
            }

            self.events.emit(&Event::LaneCompleted {
                lane: index,
                succeeded,
                failed,
            });
            lanes_completed += 1;
            tracing::debug!(lane = index, succeeded, failed, "Lane completed");

            // abort raised by a block of this lane, possibly the last one
            if self.is_aborted() {
                status = self.finish_abort(index + 1, results.len()).await;
                break;
            }

            if let (FailureMode::Strict, Some(block_id)) = (plan.failure_mode, first_failure) {
                tracing::warn!(lane = index, %block_id, "Strict mode: halting after failed lane");
                status = ExecutionStatus::Halted {
                    lane: index,
                    block_id,
                };
                break;
            }
        }

        let report = ExecutionReport {
            execution_id,
            results,
            status,
            lanes_completed,
        };
        tracing::info!(
            %execution_id,
            status = ?report.status,
            results = report.results.len(),
            failed = report.failed().count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Plan execution finished"
        );
        self.events.emit(&Event::ExecutionCompleted {
            execution_id,
            status: report.status.clone(),
            results: report.results.len(),
        });
        Ok(report)
    }

    /// Spawn one task per block and join them all.
    ///
    /// Results come back in completion order.
    async fn run_parallel(&self, block_ids: &[String]) -> (Vec<BlockResult>, LaneOutcome) {
        let mut tasks = JoinSet::new();
        let mut dispatched = Vec::with_capacity(block_ids.len());
        let mut outcome = LaneOutcome::Finished;

        for block_id in block_ids {
            if self.is_aborted() {
                tracing::warn!(
                    dispatched = dispatched.len(),
                    remaining = block_ids.len() - dispatched.len(),
                    "Abort requested mid-lane, not dispatching remaining blocks"
                );
                outcome = LaneOutcome::Interrupted;
                break;
            }
            tasks.spawn(run_block(
                self.pool.clone(),
                self.runner.clone(),
                block_id.clone(),
            ));
            dispatched.push(block_id.clone());
        }

        let mut results = Vec::with_capacity(dispatched.len());
        let mut join_errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(error = %e, "Block task failed to join");
                    join_errors.push(e.to_string());
                }
            }
        }

        // A task that never reported still owes its block a result.
        if !join_errors.is_empty() {
            let mut missing = dispatched;
            for result in &results {
                if let Some(pos) = missing.iter().position(|id| *id == result.block_id) {
                    missing.remove(pos);
                }
            }
            for (block_id, error) in missing.into_iter().zip(join_errors) {
                results.push(BlockResult::failed(block_id, error, 0));
            }
        }

        (results, outcome)
    }

    async fn finish_abort(&self, lane: usize, collected: usize) -> ExecutionStatus {
        tracing::warn!(lane, results = collected, "Execution aborted, tearing down pool");
        self.events.emit(&Event::Aborted {
            lane,
            results: collected,
        });
        self.pool.teardown().await;
        ExecutionStatus::Aborted { lane }
    }
}

/// Acquire a sandbox, run one block in it and release it.
async fn run_block(pool: SandboxPool, runner: Arc<dyn BlockRunner>, block_id: String) -> BlockResult {
    let start = Instant::now();
    let elapsed_ms = || start.elapsed().as_millis() as u64;

    let sandbox = match pool.acquire(&block_id).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            tracing::error!(%block_id, error = %e, "Could not acquire a sandbox");
            return BlockResult::failed(block_id, format!("acquire failed: {e}"), elapsed_ms());
        }
    };
    tracing::debug!(%block_id, sandbox_id = %sandbox.id, "Running block");

    let outcome = AssertUnwindSafe(runner.run_block(&block_id, &sandbox))
        .catch_unwind()
        .await;
    let result = match outcome {
        Ok(Ok(outcome)) => BlockResult::from_outcome(block_id.as_str(), outcome),
        Ok(Err(e)) => BlockResult::failed(block_id.as_str(), e.to_string(), elapsed_ms()),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(%block_id, %message, "Block runner panicked");
            BlockResult::failed(block_id.as_str(), message, elapsed_ms())
        }
    };

    if let Err(e) = pool.release(&sandbox.id).await {
        tracing::warn!(%block_id, sandbox_id = %sandbox.id, error = %e, "Release failed");
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("block runner panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("block runner panicked: {s}")
    } else {
        "block runner panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "block runner panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "block runner panicked: bang");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "block runner panicked");
    }

    #[test]
    fn test_abort_handle_is_shared() {
        let handle = AbortHandle {
            flag: Arc::new(AtomicBool::new(false)),
        };
        let other = handle.clone();
        assert!(!other.is_aborted());
        handle.abort();
        assert!(other.is_aborted());
    }
}
