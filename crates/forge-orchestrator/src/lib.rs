//! # forge-orchestrator
//!
//! Execution driver for the Forge pipeline.
//!
//! The orchestrator owns the whole run of one goal: planning, per-step
//! context retrieval, test-first generation, gating, risk scoring, and the
//! append-only execution record. Each step is driven by a pure state
//! machine; the orchestrator performs the I/O the machine's actions call
//! for and feeds the results back as events.
//!
//! Post-acceptance rollback is compensation, not erasure: the rolled-back
//! step keeps its history and a compensating step is derived for the caller
//! to execute as new work.

mod machine;
mod orchestrator;
mod rollback;
mod store;

pub use machine::{Action, StepEvent, StepMachine, StepState};
pub use orchestrator::Orchestrator;
pub use rollback::{ReverseDiffRollback, RollbackExecutor};
pub use store::{InMemoryRecordStore, RecordStore};
