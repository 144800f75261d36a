//! Build gate
//!
//! `BuildRunner` is the toolchain seam: applying a patch to a scratch tree
//! and invoking the build or test command is an external concern, injected
//! by the embedder. `BuildDoctor` interprets what comes back, classifying
//! failures and attaching a mechanical fix where one can be derived from
//! the log alone.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use forge_core::{
    FindingCategory, ForgeError, GateFinding, GateKind, Patch, Result, Severity, TestRun,
};
use regex::Regex;
use tracing::debug;

/// Outcome of one build invocation
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub success: bool,
    pub exit_code: i32,
    pub log: String,
}

impl BuildOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            exit_code: 0,
            log: String::new(),
        }
    }

    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: 1,
            log: log.into(),
        }
    }
}

/// Toolchain seam: builds and test runs against a scratch tree
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Build the tree with the patch applied
    async fn build(&self, patch: &Patch) -> Result<BuildOutput>;

    /// Run a generated test set, with the patch applied when given
    async fn run_tests(&self, test_code: &str, patch: Option<&Patch>) -> Result<TestRun>;

    /// Line coverage percentage, with the patch applied when given
    async fn coverage(&self, patch: Option<&Patch>) -> Result<f32>;
}

/// Interprets build failures into gate findings
pub struct BuildDoctor {
    missing_dependency: Regex,
    version_conflict: Regex,
    missing_declaration: Regex,
    pinned_requirement: Regex,
}

impl BuildDoctor {
    pub fn new() -> Self {
        Self {
            missing_dependency: Regex::new(
                r"(?i)cannot find crate|ModuleNotFoundError|Cannot find module|unresolved import|no matching package",
            )
            .unwrap(),
            version_conflict: Regex::new(
                r"(?i)version conflict|incompatible version|requires [\w./-]+ [~^]?\d[\w.-]* but",
            )
            .unwrap(),
            missing_declaration: Regex::new(
                r"(?i)cannot find (?:function|value|type|macro)|is not defined|undeclared identifier|undefined reference",
            )
            .unwrap(),
            pinned_requirement: Regex::new(r"(?i)requires ([\w./-]+) ([~^]?\d[\w.-]*)").unwrap(),
        }
    }

    /// Run the build gate for a patch
    ///
    /// A clean build yields no findings. Failures yield one classified
    /// finding: breakage attributable to the generated patch (a missing
    /// dependency or declaration, or a version conflict the log pins down to
    /// a mechanical fix) feeds the bounded regeneration loop as feedback;
    /// anything else is an unrecoverable build break and blocks the step.
    pub async fn check(&self, runner: &dyn BuildRunner, patch: &Patch) -> Result<Vec<GateFinding>> {
        let output = runner.build(patch).await?;

        if output.success {
            debug!("Build gate clean for patch {}", patch.id);
            return Ok(Vec::new());
        }

        let category = self.classify(&output.log);
        let message = first_error_line(&output.log)
            .unwrap_or_else(|| format!("build failed with exit code {}", output.exit_code));

        let finding =
            GateFinding::new(GateKind::Build, Severity::High, category.clone(), message);
        let finding = match category {
            FindingCategory::VersionConflict => match self.pinned_fix(&output.log) {
                Some(fix) => finding.with_proposed_fix(fix),
                None => finding.blocking(true),
            },
            FindingCategory::BuildFailure => finding.blocking(true),
            _ => finding,
        };

        debug!("Build gate failed for patch {}: {}", patch.id, finding.category);
        Ok(vec![finding])
    }

    fn classify(&self, log: &str) -> FindingCategory {
        if self.version_conflict.is_match(log) {
            FindingCategory::VersionConflict
        } else if self.missing_dependency.is_match(log) {
            FindingCategory::MissingDependency
        } else if self.missing_declaration.is_match(log) {
            FindingCategory::MissingDeclaration
        } else {
            FindingCategory::BuildFailure
        }
    }

    /// Derive a pin-the-version fix when the log names the requirement
    fn pinned_fix(&self, log: &str) -> Option<String> {
        self.pinned_requirement.captures(log).map(|c| {
            format!("pin {} to version {} in the project manifest", &c[1], &c[2])
        })
    }
}

impl Default for BuildDoctor {
    fn default() -> Self {
        Self::new()
    }
}

fn first_error_line(log: &str) -> Option<String> {
    log.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_string())
}

/// Scripted `BuildRunner` for tests: answers from canned queues, falling
/// back to a clean build and a passing test run
pub struct ScriptedBuildRunner {
    builds: Mutex<VecDeque<BuildOutput>>,
    test_runs: Mutex<VecDeque<TestRun>>,
    coverages: Mutex<VecDeque<f32>>,
    build_calls: Mutex<usize>,
    test_calls: Mutex<usize>,
    fail_next_invocation: Mutex<bool>,
    failing_builds: Mutex<u32>,
}

impl ScriptedBuildRunner {
    pub fn new() -> Self {
        Self {
            builds: Mutex::new(VecDeque::new()),
            test_runs: Mutex::new(VecDeque::new()),
            coverages: Mutex::new(VecDeque::new()),
            build_calls: Mutex::new(0),
            test_calls: Mutex::new(0),
            fail_next_invocation: Mutex::new(false),
            failing_builds: Mutex::new(0),
        }
    }

    pub fn with_build(self, output: BuildOutput) -> Self {
        if let Ok(mut queue) = self.builds.lock() {
            queue.push_back(output);
        }
        self
    }

    pub fn with_test_run(self, run: TestRun) -> Self {
        if let Ok(mut queue) = self.test_runs.lock() {
            queue.push_back(run);
        }
        self
    }

    pub fn with_coverage(self, value: f32) -> Self {
        if let Ok(mut queue) = self.coverages.lock() {
            queue.push_back(value);
        }
        self
    }

    /// Make the next call return a toolchain invocation error
    pub fn with_tool_error(self) -> Self {
        if let Ok(mut flag) = self.fail_next_invocation.lock() {
            *flag = true;
        }
        self
    }

    /// Make the next `build` call (only) return a toolchain invocation
    /// error; stacks when called repeatedly
    pub fn with_build_error(self) -> Self {
        if let Ok(mut count) = self.failing_builds.lock() {
            *count += 1;
        }
        self
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn test_calls(&self) -> usize {
        self.test_calls.lock().map(|c| *c).unwrap_or(0)
    }

    fn take_tool_error(&self) -> bool {
        self.fail_next_invocation
            .lock()
            .map(|mut flag| std::mem::take(&mut *flag))
            .unwrap_or(false)
    }

    fn take_build_error(&self) -> bool {
        self.failing_builds
            .lock()
            .map(|mut count| {
                if *count > 0 {
                    *count -= 1;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false)
    }
}

impl Default for ScriptedBuildRunner {
    fn default() -> Self {
        Self::new()
    }
}

pub fn passing_run() -> TestRun {
    TestRun {
        passed: 1,
        failed: 0,
        total: 1,
        output: "1 passed".to_string(),
    }
}

pub fn failing_run() -> TestRun {
    TestRun {
        passed: 0,
        failed: 1,
        total: 1,
        output: "1 failed: behavior not implemented".to_string(),
    }
}

#[async_trait]
impl BuildRunner for ScriptedBuildRunner {
    async fn build(&self, _patch: &Patch) -> Result<BuildOutput> {
        if self.take_tool_error() || self.take_build_error() {
            return Err(ForgeError::BuildTool("build command not found".to_string()));
        }
        if let Ok(mut calls) = self.build_calls.lock() {
            *calls += 1;
        }
        Ok(self
            .builds
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(BuildOutput::ok))
    }

    async fn run_tests(&self, _test_code: &str, _patch: Option<&Patch>) -> Result<TestRun> {
        if self.take_tool_error() {
            return Err(ForgeError::BuildTool("test command not found".to_string()));
        }
        if let Ok(mut calls) = self.test_calls.lock() {
            *calls += 1;
        }
        Ok(self
            .test_runs
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(passing_run))
    }

    async fn coverage(&self, _patch: Option<&Patch>) -> Result<f32> {
        Ok(self
            .coverages
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(80.0))
    }
}
