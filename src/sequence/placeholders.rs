//! Placeholder expansion for `{NAME}` tokens in command templates
//!
//! Supports:
//! - run scope: `{SN}`, `{RUN_ID}`, `{RUN_DIR}`, `{TOOLS_DIR}`
//! - step scope: `{STEP_ID}`, `{STEP_NAME}`, `{STEP_ORDER}`, `{STEP_DIR}`, `{WORKDIR}`
//! - `{ENV:VAR}` for process environment lookups
//!
//! Unknown tokens stay in the output verbatim.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Z0-9_:\-]+)\}").unwrap());

/// Values available to command templates
#[derive(Debug, Clone, Default)]
pub struct PlaceholderContext {
    values: HashMap<String, String>,
}

impl PlaceholderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a placeholder value
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Builder form of [`PlaceholderContext::set`]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.values.get(key)
    }

    /// Copy of this context extended with step-scoped values
    pub fn scoped(&self, extra: &[(&str, String)]) -> Self {
        let mut ctx = self.clone();
        for (key, value) in extra {
            ctx.set(key, value.clone());
        }
        ctx
    }

    /// Expand all `{NAME}` tokens in `input`
    pub fn expand(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }
        PLACEHOLDER_REGEX
            .replace_all(input, |caps: &Captures| {
                let key = &caps[1];
                if let Some(var) = key.strip_prefix("ENV:") {
                    return std::env::var(var).unwrap_or_default();
                }
                match self.values.get(key) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}
