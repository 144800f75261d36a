//! # forge-agents
//!
//! The specialist agents of the Forge pipeline: planning, code generation,
//! test-first validation, the security and build gates, and risk scoring.
//! Every agent that needs inference goes through the provider gateway;
//! every agent that needs a toolchain goes through the `BuildRunner` seam.

mod build_doctor;
mod codegen;
mod extract;
mod planner;
mod risk;
mod security;
mod test_first;

pub use build_doctor::{
    failing_run, passing_run, BuildDoctor, BuildOutput, BuildRunner, ScriptedBuildRunner,
};
pub use codegen::CodeGenerator;
pub use planner::Planner;
pub use risk::RiskAssessor;
pub use security::{SecurityAnalyzer, StaticAnalysisTool};
pub use test_first::TestFirstAgent;
