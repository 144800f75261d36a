//! # forge-core
//!
//! Core types for the Forge autonomous code-change pipeline.
//!
//! Forge turns a natural-language development goal into an auditable sequence
//! of patch attempts: a planner decomposes the goal into steps, each step
//! retrieves context, generates a candidate patch, proves it with generated
//! tests, passes security and build gates, and receives a risk score before
//! being accepted into the execution record.
//!
//! ## Core Paradigm
//!
//! - A plan is immutable once accepted; re-planning creates a new plan
//! - Patches are immutable values; rejection yields a new patch, never an edit
//! - The execution record is append-only and owned by a single writer
//! - Gates veto, they never mutate

mod config;
mod error;
mod record;
mod types;

pub use config::{
    ContextConfig, GateConfig, PipelineConfig, ProviderConfig, RiskWeights, TestFirstConfig,
};
pub use error::{FailureClass, ForgeError, Result};
pub use record::{
    EventKind, ExecutionRecord, ExecutionStatus, PatchAttempt, RecordEvent, StepRecord,
};
pub use types::*;
