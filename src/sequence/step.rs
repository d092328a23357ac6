//! Step definitions
//!
//! A station sequence is an ordered list of [`StepSpec`] records. Each step
//! spawns one external process and is judged by its `pass_by` expression.

use serde::{Deserialize, Deserializer, Serialize};

/// A single step in a station sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Execution order; together with `name` forms the step id
    pub order: i64,

    /// Step name
    pub name: String,

    /// Execution kind (only `process` is executed today)
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    /// Command template, may contain `{PLACEHOLDER}` tokens
    #[serde(default)]
    pub cmd: String,

    /// Working directory override (relative to the project root)
    #[serde(default)]
    pub workdir: String,

    /// Timeout in seconds, 0 means unbounded. `None` falls back to the run default.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Extra attempts after the first one
    #[serde(default)]
    pub retry: u32,

    /// Pause between attempts in seconds
    #[serde(default)]
    pub retry_interval_sec: u64,

    /// Failures are recorded but never block the run
    #[serde(default)]
    pub ignore_result: bool,

    /// Pass-criteria expression, empty means `exit_code == 0`
    #[serde(default)]
    pub pass_by: String,

    /// Kill the whole process tree on timeout
    #[serde(default = "default_kill_tree")]
    pub kill_tree: bool,

    /// Encoding label used to decode stdout/stderr
    #[serde(default = "default_encoding")]
    pub stdout_encoding: String,

    /// Artifact paths the step is expected to produce
    #[serde(default, deserialize_with = "deserialize_list")]
    pub artifacts: Vec<String>,

    /// Exit codes meaning "external validation still outstanding"
    #[serde(default, deserialize_with = "deserialize_exit_codes")]
    pub pending_exit_codes: Vec<i32>,
}

fn default_kind() -> String {
    "process".to_string()
}

fn default_kill_tree() -> bool {
    true
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl StepSpec {
    /// Create a process step with default settings
    pub fn new(order: i64, name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            order,
            name: name.into(),
            kind: default_kind(),
            cmd: cmd.into(),
            workdir: String::new(),
            timeout: None,
            retry: 0,
            retry_interval_sec: 0,
            ignore_result: false,
            pass_by: String::new(),
            kill_tree: default_kill_tree(),
            stdout_encoding: default_encoding(),
            artifacts: Vec::new(),
            pending_exit_codes: Vec::new(),
        }
    }

    /// Step identifier, `"{order}_{name}"`
    pub fn sid(&self) -> String {
        format!("{}_{}", self.order, self.name)
    }

    /// Effective timeout in seconds given the run-level default
    pub fn timeout_secs(&self, default_timeout: u64) -> u64 {
        self.timeout.unwrap_or(default_timeout)
    }

    pub fn is_pending_code(&self, code: i32) -> bool {
        self.pending_exit_codes.contains(&code)
    }
}

/// Parse a comma-separated list of exit codes, dropping anything unparsable
pub fn parse_exit_codes(value: &str) -> Vec<i32> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrString<T> {
    List(Vec<T>),
    Text(String),
    One(T),
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<ListOrString<String>>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(ListOrString::List(items)) => Ok(items),
        Some(ListOrString::One(item)) => Ok(vec![item]),
        Some(ListOrString::Text(text)) => Ok(text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()),
    }
}

fn deserialize_exit_codes<'de, D>(deserializer: D) -> Result<Vec<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<ListOrString<i32>>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(ListOrString::List(codes)) => Ok(codes),
        Some(ListOrString::One(code)) => Ok(vec![code]),
        Some(ListOrString::Text(text)) => Ok(parse_exit_codes(&text)),
    }
}
