//! Execution plans, block results and execution reports.
//!
//! Plans are plain data and load directly from JSON:
//!
//! ```
//! use skiff_core::{ExecutionPlan, FailureMode, Lane};
//!
//! let plan: ExecutionPlan = serde_json::from_str(r#"{
//!     "lanes": ["fetch", { "blockIds": ["resize", "thumbnail"] }, "publish"],
//!     "failureMode": "strict"
//! }"#).unwrap();
//!
//! assert_eq!(plan.lanes.len(), 3);
//! assert!(matches!(plan.lanes[1], Lane::Parallel(_)));
//! assert_eq!(plan.failure_mode, FailureMode::Strict);
//! ```

use crate::config::ParallelismModel;
use crate::error::CoreError;
use crate::runner::BlockOutcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What to do after a block fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Stop scheduling lanes after the first lane with a failure.
    Strict,
    /// Run every lane regardless of failures.
    #[default]
    Lenient,
}

/// A group of blocks run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    /// Blocks in the group.
    pub block_ids: Vec<String>,
    /// Opaque merge hint, passed through to events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<serde_json::Value>,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lane {
    /// A single block.
    Sequential(String),
    /// Blocks run concurrently and joined.
    Parallel(ParallelGroup),
}

impl Lane {
    /// Blocks in the lane, in declaration order.
    pub fn block_ids(&self) -> Vec<String> {
        match self {
            Self::Sequential(id) => vec![id.clone()],
            Self::Parallel(group) => group.block_ids.clone(),
        }
    }

    /// Whether this is a parallel lane.
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel(_))
    }
}

/// Ordered lanes plus the policies to run them with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Lanes, run strictly in order.
    pub lanes: Vec<Lane>,
    /// Sandbox sharing model the plan expects.
    #[serde(default)]
    pub parallelism_model: ParallelismModel,
    /// Failure policy.
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl ExecutionPlan {
    /// Empty lenient multi-sandbox plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single-block lane.
    pub fn sequential(mut self, block_id: impl Into<String>) -> Self {
        self.lanes.push(Lane::Sequential(block_id.into()));
        self
    }

    /// Append a parallel lane.
    pub fn parallel<I, S>(mut self, block_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lanes.push(Lane::Parallel(ParallelGroup {
            block_ids: block_ids.into_iter().map(Into::into).collect(),
            merge_strategy: None,
        }));
        self
    }

    /// Set the failure mode.
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Set the parallelism model.
    pub fn parallelism_model(mut self, model: ParallelismModel) -> Self {
        self.parallelism_model = model;
        self
    }

    /// Total number of requested blocks.
    pub fn block_count(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| match lane {
                Lane::Sequential(_) => 1,
                Lane::Parallel(group) => group.block_ids.len(),
            })
            .sum()
    }

    /// Reject plans the executor cannot run.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (index, lane) in self.lanes.iter().enumerate() {
            match lane {
                Lane::Sequential(id) if id.trim().is_empty() => {
                    return Err(CoreError::InvalidPlan(format!("lane {index}: empty block id")));
                }
                Lane::Parallel(group) if group.block_ids.is_empty() => {
                    return Err(CoreError::InvalidPlan(format!(
                        "lane {index}: parallel group has no blocks"
                    )));
                }
                Lane::Parallel(group) if group.block_ids.iter().any(|id| id.trim().is_empty()) => {
                    return Err(CoreError::InvalidPlan(format!("lane {index}: empty block id")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Outcome of one requested block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResult {
    /// Block id.
    pub block_id: String,
    /// Whether the block succeeded.
    pub success: bool,
    /// Opaque block output.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Failure message, present iff `!success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl BlockResult {
    /// A failed result.
    pub fn failed(block_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            block_id: block_id.into(),
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// Normalise a runner outcome so `error` is set exactly when it failed.
    pub fn from_outcome(block_id: impl Into<String>, outcome: BlockOutcome) -> Self {
        let error = if outcome.success {
            None
        } else {
            Some(
                outcome
                    .error
                    .unwrap_or_else(|| "block reported failure".to_string()),
            )
        };
        Self {
            block_id: block_id.into(),
            success: outcome.success,
            output: outcome.output,
            error,
            duration_ms: outcome.duration_ms,
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutionStatus {
    /// Every lane was scheduled.
    Completed,
    /// Strict mode stopped scheduling after `lane` failed.
    Halted {
        /// Index of the failing lane.
        lane: usize,
        /// First failing block in that lane.
        block_id: String,
    },
    /// `abort` stopped scheduling at `lane`.
    Aborted {
        /// First lane that did not run to completion.
        lane: usize,
    },
}

/// Result of [`LaneExecutor::execute`](crate::LaneExecutor::execute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Unique id of this execution.
    pub execution_id: Uuid,
    /// Results of all scheduled lanes, in lane order.
    pub results: Vec<BlockResult>,
    /// How the execution ended.
    pub status: ExecutionStatus,
    /// Lanes that ran to completion.
    pub lanes_completed: usize,
}

impl ExecutionReport {
    /// Result for `block_id`, if the block ran.
    pub fn result_for(&self, block_id: &str) -> Option<&BlockResult> {
        self.results.iter().find(|r| r.block_id == block_id)
    }

    /// Failed results.
    pub fn failed(&self) -> impl Iterator<Item = &BlockResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Completed with no failures.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.results.iter().all(|r| r.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_json_forms() {
        let plan: ExecutionPlan = serde_json::from_str(
            r#"{
                "lanes": [
                    "a",
                    { "blockIds": ["b", "c"], "mergeStrategy": "concat" }
                ],
                "parallelismModel": "single-sandbox"
            }"#,
        )
        .unwrap();

        assert_eq!(plan.lanes[0], Lane::Sequential("a".into()));
        let Lane::Parallel(group) = &plan.lanes[1] else {
            panic!("expected a parallel lane");
        };
        assert_eq!(group.block_ids, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(group.merge_strategy, Some(serde_json::json!("concat")));
        assert_eq!(plan.parallelism_model, ParallelismModel::SingleSandbox);
        assert_eq!(plan.failure_mode, FailureMode::Lenient);
        assert_eq!(plan.block_count(), 3);
    }

    #[test]
    fn test_builder_matches_json() {
        let built = ExecutionPlan::new()
            .sequential("a")
            .parallel(["b", "c"])
            .failure_mode(FailureMode::Strict);
        let json = serde_json::to_value(&built).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "lanes": ["a", { "blockIds": ["b", "c"] }],
                "parallelismModel": "multi-sandbox",
                "failureMode": "strict"
            })
        );
    }

    #[test]
    fn test_validate_rejects_empty_group() {
        let plan = ExecutionPlan::new().parallel(Vec::<String>::new());
        assert!(matches!(plan.validate(), Err(CoreError::InvalidPlan(_))));
        assert!(ExecutionPlan::new().sequential(" ").validate().is_err());
        assert!(ExecutionPlan::new().sequential("a").validate().is_ok());
    }

    #[test]
    fn test_from_outcome_normalises_error() {
        let ok = BlockResult::from_outcome(
            "a",
            BlockOutcome {
                success: true,
                output: serde_json::json!({"rows": 3}),
                error: Some("ignored".into()),
                duration_ms: 12,
            },
        );
        assert!(ok.success);
        assert_eq!(ok.error, None);

        let failed = BlockResult::from_outcome(
            "b",
            BlockOutcome {
                success: false,
                output: serde_json::Value::Null,
                error: None,
                duration_ms: 1,
            },
        );
        assert_eq!(failed.error.as_deref(), Some("block reported failure"));
    }

    #[test]
    fn test_report_helpers() {
        let report = ExecutionReport {
            execution_id: Uuid::new_v4(),
            results: vec![
                BlockResult::from_outcome("a", BlockOutcome::ok(serde_json::Value::Null, 1)),
                BlockResult::failed("b", "boom", 2),
            ],
            status: ExecutionStatus::Completed,
            lanes_completed: 2,
        };
        assert!(report.result_for("a").unwrap().success);
        assert!(report.result_for("z").is_none());
        assert_eq!(report.failed().count(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_status_serialization() {
        let status = ExecutionStatus::Halted {
            lane: 1,
            block_id: "x".into(),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"status": "halted", "lane": 1, "blockId": "x"})
        );
    }
}
