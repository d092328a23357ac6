//! Station configuration
//!
//! The station file carries station metadata, run-level policy, and the
//! ordered step list:
//!
//! ```yaml
//! meta:
//!   station_id: ST01
//!   line_id: L3
//!   model: X100
//!
//! run:
//!   run_mode: stop_on_fail
//!   default_timeout_sec: 120
//!   report_emit_on: "stopped_on_fail"
//!   workdir: "."
//!
//! steps:
//!   - order: 10
//!     name: Power
//!     cmd: "power_on.sh {SN}"
//!     pass_by: "exit_code:0|stdout_contains:POWER OK"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::step::StepSpec;
use crate::engine::evaluator::{PassCriteria, RuleError};

/// What to do after a non-ignored step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Skip all later steps and finish the run as FAIL
    #[default]
    StopOnFail,
    /// Keep executing; the run is FAIL if any non-ignored step failed
    #[serde(alias = "continue_on_fail")]
    Continue,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::StopOnFail => write!(f, "stop_on_fail"),
            RunMode::Continue => write!(f, "continue"),
        }
    }
}

/// When the report file is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPolicy {
    pub always: bool,
    pub stopped_on_fail: bool,
}

impl ReportPolicy {
    /// Parse comma-separated tokens; unknown tokens are ignored
    pub fn parse(value: &str) -> Self {
        let mut policy = Self {
            always: false,
            stopped_on_fail: false,
        };
        for token in value.split(',').map(str::trim) {
            match token {
                "always" => policy.always = true,
                "stopped_on_fail" => policy.stopped_on_fail = true,
                _ => {}
            }
        }
        policy
    }

    /// Whether a run that ended this way should emit a report
    pub fn should_emit(&self, stopped_on_fail: bool) -> bool {
        self.always || (self.stopped_on_fail && stopped_on_fail)
    }
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self::parse("stopped_on_fail")
    }
}

impl fmt::Display for ReportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        if self.always {
            tokens.push("always");
        }
        if self.stopped_on_fail {
            tokens.push("stopped_on_fail");
        }
        write!(f, "{}", tokens.join(","))
    }
}

impl Serialize for ReportPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReportPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Tokens {
            List(Vec<String>),
            Text(String),
        }

        match Tokens::deserialize(deserializer)? {
            Tokens::List(items) => Ok(Self::parse(&items.join(","))),
            Tokens::Text(text) => Ok(Self::parse(&text)),
        }
    }
}

/// Station identification recorded in every run snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StationMeta {
    #[serde(default)]
    pub station_id: String,
    #[serde(default)]
    pub line_id: String,
    #[serde(default)]
    pub model: String,
}

impl StationMeta {
    /// Non-empty, trimmed fields only
    pub fn pruned(&self) -> BTreeMap<String, String> {
        [
            ("station_id", &self.station_id),
            ("line_id", &self.line_id),
            ("model", &self.model),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value.trim();
            (!value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
    }
}

/// Run-level policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub run_mode: RunMode,

    #[serde(default = "default_timeout_sec")]
    pub default_timeout_sec: u64,

    #[serde(default, alias = "report.emit_on")]
    pub report_emit_on: ReportPolicy,

    /// Global working directory (relative to the project root)
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

fn default_timeout_sec() -> u64 {
    120
}

fn default_workdir() -> String {
    ".".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            default_timeout_sec: default_timeout_sec(),
            report_emit_on: ReportPolicy::default(),
            workdir: default_workdir(),
        }
    }
}

/// A malformed pass-criteria clause found while validating the configuration
#[derive(Debug, Clone)]
pub struct RuleDiagnostic {
    pub sid: String,
    pub clause: String,
    pub error: RuleError,
}

impl fmt::Display for RuleDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: '{}': {}", self.sid, self.clause, self.error)
    }
}

/// The complete, already-parsed station configuration handed to the engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StationConfig {
    #[serde(default)]
    pub meta: StationMeta,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub steps: Vec<StepSpec>,

    /// Directory holding `runs/` and `tools/`
    #[serde(skip)]
    pub project_root: PathBuf,

    /// Directory of the station file, secondary base for relative paths
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Where the configuration came from, if loaded from disk
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl StationConfig {
    /// Build an in-memory configuration rooted at `project_root`
    pub fn new(project_root: impl AsRef<Path>, steps: Vec<StepSpec>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let mut steps = steps;
        steps.sort_by_key(|s| s.order);
        Self {
            meta: StationMeta::default(),
            run: RunConfig::default(),
            steps,
            config_dir: root.clone(),
            project_root: root,
            config_path: None,
        }
    }

    pub fn with_run(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    pub fn with_meta(mut self, meta: StationMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Directory holding per-serial run directories
    pub fn runs_root(&self) -> PathBuf {
        self.project_root.join("runs")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.project_root.join("tools")
    }

    /// Resolve a configured working directory.
    ///
    /// Absolute paths are used as-is. Relative paths resolve against the
    /// project root unless only the config-directory candidate exists.
    pub fn resolve_workdir(&self, workdir: impl AsRef<Path>) -> PathBuf {
        let workdir = workdir.as_ref();
        if workdir.is_absolute() {
            return workdir.to_path_buf();
        }
        let candidate_project = self.project_root.join(workdir);
        let candidate_config = self.config_dir.join(workdir);
        if candidate_project.exists() || !candidate_config.exists() {
            candidate_project
        } else {
            candidate_config
        }
    }

    /// Working directory a step runs in
    pub fn step_workdir(&self, step: &StepSpec) -> PathBuf {
        if step.workdir.trim().is_empty() {
            self.resolve_workdir(&self.run.workdir)
        } else {
            self.resolve_workdir(&step.workdir)
        }
    }

    /// Parse every step's pass criteria and collect malformed clauses
    pub fn validate(&self) -> Vec<RuleDiagnostic> {
        let mut diagnostics = Vec::new();
        for step in &self.steps {
            let criteria = PassCriteria::parse(&step.pass_by);
            for (clause, error) in criteria.malformed() {
                diagnostics.push(RuleDiagnostic {
                    sid: step.sid(),
                    clause: clause.to_string(),
                    error: error.clone(),
                });
            }
        }
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_run_config() {
        let config = RunConfig::default();
        assert_eq!(config.run_mode, RunMode::StopOnFail);
        assert_eq!(config.default_timeout_sec, 120);
        assert!(config.report_emit_on.stopped_on_fail);
        assert!(!config.report_emit_on.always);
        assert_eq!(config.workdir, ".");
    }

    #[test]
    fn test_parse_run_config() {
        let yaml = r#"
run_mode: continue
default_timeout_sec: 30
report_emit_on: "always, stopped_on_fail, bogus"
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.run_mode, RunMode::Continue);
        assert_eq!(config.default_timeout_sec, 30);
        assert!(config.report_emit_on.always);
        assert!(config.report_emit_on.stopped_on_fail);
    }

    #[test]
    fn test_report_policy() {
        let policy = ReportPolicy::parse("stopped_on_fail");
        assert!(policy.should_emit(true));
        assert!(!policy.should_emit(false));

        let policy = ReportPolicy::parse("always");
        assert!(policy.should_emit(false));

        let policy = ReportPolicy::parse("");
        assert!(!policy.should_emit(true));
        assert_eq!(ReportPolicy::parse("always,stopped_on_fail").to_string(), "always,stopped_on_fail");
    }

    #[test]
    fn test_station_meta_pruned() {
        let meta = StationMeta {
            station_id: " ST01 ".to_string(),
            line_id: "  ".to_string(),
            model: "X100".to_string(),
        };
        let pruned = meta.pruned();
        assert_eq!(pruned.get("station_id"), Some(&"ST01".to_string()));
        assert!(!pruned.contains_key("line_id"));
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_validate_reports_malformed_rules() {
        let mut step = StepSpec::new(10, "Power", "true");
        step.pass_by = "exit_code:zero|stdout_contains:OK|stdout_regex:(".to_string();
        let config = StationConfig::new("/tmp", vec![step]);

        let diagnostics = config.validate();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].sid, "10_Power");
        assert_eq!(diagnostics[0].clause, "exit_code:zero");
    }

    #[test]
    fn test_resolve_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        let config_dir = project.join("config");
        std::fs::create_dir_all(config_dir.join("only_in_config")).unwrap();

        let mut config = StationConfig::new(&project, vec![]);
        config.config_dir = config_dir.clone();

        assert_eq!(config.resolve_workdir("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(config.resolve_workdir("bin"), project.join("bin"));
        assert_eq!(
            config.resolve_workdir("only_in_config"),
            config_dir.join("only_in_config")
        );
    }
}
