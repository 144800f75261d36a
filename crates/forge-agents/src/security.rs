//! Security gate
//!
//! Scans the added lines of a candidate patch against a per-language rule
//! catalog (dynamic execution, shell injection, hardcoded credentials, SQL
//! string building, unsafe deserialization, weak hashing), each rule mapped
//! to its CWE. External static-analysis tools plug in through the
//! `StaticAnalysisTool` seam and their output is normalized into the same
//! finding shape. Findings at or above the configured threshold get the
//! blocking flag, which vetoes the step.

use std::sync::Arc;

use async_trait::async_trait;
use forge_core::{
    FindingCategory, GateConfig, GateFinding, GateKind, Patch, Result, Severity,
};
use regex::Regex;
use tracing::{debug, warn};

/// External scanner seam (semgrep and friends)
///
/// Tool output is merged with the built-in catalog. A tool that errors is
/// skipped with a warning; the built-in rules still run.
#[async_trait]
pub trait StaticAnalysisTool: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, patch: &Patch) -> Result<Vec<GateFinding>>;
}

struct SecurityRule {
    pattern: Regex,
    /// Extensions this rule applies to; empty means every language
    extensions: &'static [&'static str],
    severity: Severity,
    category: FindingCategory,
    cwe: &'static str,
    message: &'static str,
    fix: Option<&'static str>,
}

pub struct SecurityAnalyzer {
    rules: Vec<SecurityRule>,
    tools: Vec<Arc<dyn StaticAnalysisTool>>,
    config: GateConfig,
}

impl SecurityAnalyzer {
    pub fn new(config: GateConfig) -> Self {
        Self {
            rules: rule_catalog(),
            tools: Vec::new(),
            config,
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn StaticAnalysisTool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Run the security gate over a candidate patch
    ///
    /// Only lines the patch adds are scanned; pre-existing code is out of
    /// scope for the gate. Findings come back ordered most severe first.
    pub async fn analyze(&self, patch: &Patch) -> Result<Vec<GateFinding>> {
        let mut findings = self.scan_added_lines(patch);

        for tool in &self.tools {
            match tool.scan(patch).await {
                Ok(tool_findings) => findings.extend(tool_findings),
                Err(err) => {
                    warn!("Static analysis tool {} skipped: {}", tool.name(), err);
                }
            }
        }

        for finding in &mut findings {
            finding.blocking = finding.severity >= self.config.blocking_threshold;
        }

        findings.sort_by(|a, b| {
            b.severity.cmp(&a.severity).then_with(|| {
                let key = |f: &GateFinding| {
                    f.location
                        .as_ref()
                        .map(|l| (l.path.clone(), l.line.unwrap_or(0)))
                        .unwrap_or_default()
                };
                key(a).cmp(&key(b))
            })
        });

        debug!(
            "Security gate: {} findings for patch {} ({} blocking)",
            findings.len(),
            patch.id,
            findings.iter().filter(|f| f.blocking).count()
        );
        Ok(findings)
    }

    fn scan_added_lines(&self, patch: &Patch) -> Vec<GateFinding> {
        let mut findings = Vec::new();
        let mut current_file = String::new();
        let mut new_line = 0usize;

        for line in patch.diff.lines() {
            if let Some(path) = line.strip_prefix("+++ b/") {
                current_file = path.to_string();
                continue;
            }
            if line.starts_with("@@") {
                new_line = hunk_new_start(line).unwrap_or(1);
                continue;
            }
            if line.starts_with('-') || line.starts_with("+++") {
                continue;
            }

            let added = line.strip_prefix('+');
            let content = added.unwrap_or(line);

            if added.is_some() {
                let ext = extension(&current_file);
                for rule in &self.rules {
                    if !rule.extensions.is_empty() && !rule.extensions.contains(&ext) {
                        continue;
                    }
                    if rule.pattern.is_match(content) {
                        let mut finding = GateFinding::new(
                            GateKind::Security,
                            rule.severity,
                            rule.category.clone(),
                            rule.message,
                        )
                        .at(current_file.clone(), Some(new_line))
                        .with_cwe(rule.cwe);
                        if let Some(fix) = rule.fix {
                            finding = finding.with_proposed_fix(fix);
                        }
                        findings.push(finding);
                    }
                }
            }

            // Context and added lines both advance the new-file counter
            new_line += 1;
        }

        findings
    }
}

fn extension(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or("")
}

fn hunk_new_start(header: &str) -> Option<usize> {
    // "@@ -a,b +c,d @@"
    let plus = header.split('+').nth(1)?;
    let start = plus.split([',', ' ']).next()?;
    start.parse().ok()
}

fn rule_catalog() -> Vec<SecurityRule> {
    vec![
        SecurityRule {
            pattern: Regex::new(r"\beval\s*\(").unwrap(),
            extensions: &["py", "js", "jsx", "ts", "tsx", "rb"],
            severity: Severity::Critical,
            category: FindingCategory::DynamicExecution,
            cwe: "CWE-94",
            message: "dynamic code execution via eval()",
            fix: Some("parse the input instead of evaluating it"),
        },
        SecurityRule {
            pattern: Regex::new(r"\bexec\s*\(\s*[^)\s]").unwrap(),
            extensions: &["py"],
            severity: Severity::Critical,
            category: FindingCategory::DynamicExecution,
            cwe: "CWE-94",
            message: "dynamic code execution via exec()",
            fix: None,
        },
        SecurityRule {
            pattern: Regex::new(r"shell\s*=\s*True").unwrap(),
            extensions: &["py"],
            severity: Severity::High,
            category: FindingCategory::ShellInjection,
            cwe: "CWE-78",
            message: "subprocess invoked with shell=True",
            fix: Some("pass arguments as a list with shell=False"),
        },
        SecurityRule {
            pattern: Regex::new(r"os\.system\s*\(").unwrap(),
            extensions: &["py"],
            severity: Severity::High,
            category: FindingCategory::ShellInjection,
            cwe: "CWE-78",
            message: "shell command built with os.system()",
            fix: Some("use subprocess.run with an argument list"),
        },
        SecurityRule {
            pattern: Regex::new(r"exec(?:Sync)?\s*\([^)]*[`$]").unwrap(),
            extensions: &["js", "jsx", "ts", "tsx"],
            severity: Severity::High,
            category: FindingCategory::ShellInjection,
            cwe: "CWE-78",
            message: "shell command built from interpolated string",
            fix: Some("use execFile with an argument array"),
        },
        SecurityRule {
            pattern: Regex::new(r#"(?i)\b(password|passwd|secret|api_key|apikey|auth_token)\s*[:=]\s*["'][^"']{4,}["']"#)
                .unwrap(),
            extensions: &[],
            severity: Severity::High,
            category: FindingCategory::HardcodedCredentials,
            cwe: "CWE-798",
            message: "hardcoded credential",
            fix: Some("read the value from the environment or a secret store"),
        },
        SecurityRule {
            pattern: Regex::new(r#"(?i)["'](?:SELECT|INSERT INTO|UPDATE|DELETE FROM)\b[^"']*["']\s*\+"#)
                .unwrap(),
            extensions: &[],
            severity: Severity::High,
            category: FindingCategory::SqlInjection,
            cwe: "CWE-89",
            message: "SQL statement built by string concatenation",
            fix: Some("use a parameterized query"),
        },
        SecurityRule {
            pattern: Regex::new(r"pickle\.loads?\s*\(").unwrap(),
            extensions: &["py"],
            severity: Severity::High,
            category: FindingCategory::UnsafeDeserialization,
            cwe: "CWE-502",
            message: "deserialization of untrusted data via pickle",
            fix: Some("use a safe format such as JSON"),
        },
        SecurityRule {
            pattern: Regex::new(r"yaml\.load\s*\((?:[^)]*)?\)").unwrap(),
            extensions: &["py"],
            severity: Severity::Medium,
            category: FindingCategory::UnsafeDeserialization,
            cwe: "CWE-502",
            message: "yaml.load without an explicit safe loader",
            fix: Some("use yaml.safe_load"),
        },
        SecurityRule {
            pattern: Regex::new(r"(?i)\b(md5|sha1)\s*\(").unwrap(),
            extensions: &[],
            severity: Severity::Medium,
            category: FindingCategory::WeakCryptography,
            cwe: "CWE-327",
            message: "weak hash algorithm",
            fix: Some("use SHA-256 or stronger"),
        },
    ]
}
