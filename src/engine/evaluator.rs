//! Pass-criteria evaluation
//!
//! A step's `pass_by` expression is a `|`-separated list of clauses such as
//! `exit_code:0|stdout_regex:PASS|file_exists:out/result.txt`. Clauses are
//! parsed once into [`PassRule`] values and checked left to right; the first
//! satisfied clause wins. A clause that is malformed, or that fails while
//! being checked (unreadable file, bad JSON/XML), is skipped so it can never
//! abort the judgement. An empty expression means `exit_code == 0`.

use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tracing::debug;

/// Why a single clause could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("unknown rule kind '{0}'")]
    UnknownKind(String),

    #[error("invalid exit code '{0}'")]
    InvalidExitCode(String),

    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    #[error("expected {0}")]
    MissingSeparator(&'static str),
}

/// One parsed pass-criteria clause
#[derive(Debug, Clone)]
pub enum PassRule {
    ExitCode(i32),
    StdoutRegex(Regex),
    StdoutContains(String),
    StdoutEqual(String),
    StderrRegex(Regex),
    StderrContains(String),
    FileExists(PathBuf),
    FileContains { path: PathBuf, needle: String },
    JsonField { path: PathBuf, pointer: String, expected: String },
    JunitResult { path: PathBuf, expected: String },
}

impl PassRule {
    /// Parse a single clause like `stdout_contains:OK`
    pub fn parse(clause: &str) -> Result<Self, RuleError> {
        let (kind, rest) = clause
            .split_once(':')
            .ok_or_else(|| RuleError::UnknownKind(clause.to_string()))?;

        let rule = match kind {
            "exit_code" => {
                let code = rest
                    .trim()
                    .parse()
                    .map_err(|_| RuleError::InvalidExitCode(rest.trim().to_string()))?;
                PassRule::ExitCode(code)
            }
            "stdout_regex" => PassRule::StdoutRegex(multiline_regex(rest)?),
            "stdout_contains" => PassRule::StdoutContains(rest.to_string()),
            "stdout_equal" => PassRule::StdoutEqual(rest.trim().to_string()),
            "stderr_regex" => PassRule::StderrRegex(multiline_regex(rest)?),
            "stderr_contains" => PassRule::StderrContains(rest.to_string()),
            "file_exists" => PassRule::FileExists(PathBuf::from(rest)),
            "file_contains" => {
                let (path, needle) = rest
                    .split_once(':')
                    .ok_or(RuleError::MissingSeparator("file_contains:<path>:<substring>"))?;
                PassRule::FileContains {
                    path: PathBuf::from(path),
                    needle: needle.to_string(),
                }
            }
            "json_field" => {
                let (path, query) = rest
                    .split_once(':')
                    .ok_or(RuleError::MissingSeparator("json_field:<path>:$.a.b=<value>"))?;
                let (pointer, expected) = query
                    .split_once('=')
                    .ok_or(RuleError::MissingSeparator("json_field:<path>:$.a.b=<value>"))?;
                PassRule::JsonField {
                    path: PathBuf::from(path),
                    pointer: pointer.to_string(),
                    expected: expected.to_string(),
                }
            }
            "junit_result" => {
                let (path, expected) = rest
                    .split_once('=')
                    .ok_or(RuleError::MissingSeparator("junit_result:<path>=PASS"))?;
                PassRule::JunitResult {
                    path: PathBuf::from(path),
                    expected: expected.to_string(),
                }
            }
            other => return Err(RuleError::UnknownKind(other.to_string())),
        };
        Ok(rule)
    }

    /// Check the clause against one attempt's output.
    ///
    /// `Err` means the clause could not be checked and is treated as unmatched.
    pub fn check(&self, output: &AttemptOutput<'_>) -> Result<bool, String> {
        match self {
            PassRule::ExitCode(code) => Ok(output.exit_code == *code),
            PassRule::StdoutRegex(re) => Ok(re.is_match(output.stdout)),
            PassRule::StdoutContains(needle) => Ok(output.stdout.contains(needle.as_str())),
            PassRule::StdoutEqual(expected) => Ok(output.stdout.trim() == expected),
            PassRule::StderrRegex(re) => Ok(re.is_match(output.stderr)),
            PassRule::StderrContains(needle) => Ok(output.stderr.contains(needle.as_str())),
            PassRule::FileExists(path) => Ok(resolve(output.workdir, path).exists()),
            PassRule::FileContains { path, needle } => {
                let path = resolve(output.workdir, path);
                if !path.exists() {
                    return Ok(false);
                }
                let content = read_text(&path)?;
                Ok(content.contains(needle.as_str()))
            }
            PassRule::JsonField {
                path,
                pointer,
                expected,
            } => {
                let path = resolve(output.workdir, path);
                if !path.exists() {
                    return Ok(false);
                }
                let data: Value =
                    serde_json::from_str(&read_text(&path)?).map_err(|e| e.to_string())?;
                Ok(json_lookup(&data, pointer).is_some_and(|v| json_matches(v, expected)))
            }
            PassRule::JunitResult { path, expected } => {
                let path = resolve(output.workdir, path);
                if !path.exists() {
                    return Ok(false);
                }
                let text = read_text(&path)?;
                let doc = roxmltree::Document::parse(&text).map_err(|e| e.to_string())?;
                let root = doc.root_element();
                let failures = root.attribute("failures").unwrap_or("0");
                let errors = root.attribute("errors").unwrap_or("0");
                Ok(failures == "0" && errors == "0" && expected.eq_ignore_ascii_case("PASS"))
            }
        }
    }
}

fn multiline_regex(pattern: &str) -> Result<Regex, RuleError> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|e| RuleError::InvalidRegex(e.to_string()))
}

fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn read_text(path: &Path) -> Result<String, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Follow a `$.a.b` path through nested objects
fn json_lookup<'a>(data: &'a Value, pointer: &str) -> Option<&'a Value> {
    let keys = pointer.strip_prefix("$.")?;
    keys.split('.').try_fold(data, |cur, key| cur.as_object()?.get(key))
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Booleans also match their capitalised spelling (`True` / `False`)
fn json_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::Bool(true) => expected == "true" || expected == "True",
        Value::Bool(false) => expected == "false" || expected == "False",
        other => json_text(other) == expected,
    }
}

/// Everything a rule may look at for one finished attempt
#[derive(Debug, Clone, Copy)]
pub struct AttemptOutput<'a> {
    pub exit_code: i32,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub workdir: &'a Path,
}

/// Outcome of evaluating a criteria expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub matched: String,
}

#[derive(Debug, Clone)]
enum Clause {
    Rule { text: String, rule: PassRule },
    Malformed { text: String, error: RuleError },
}

/// A parsed `pass_by` expression
#[derive(Debug, Clone, Default)]
pub struct PassCriteria {
    clauses: Vec<Clause>,
}

impl PassCriteria {
    /// Parse an expression; malformed clauses are kept so they can be reported
    pub fn parse(expression: &str) -> Self {
        let clauses = expression
            .split('|')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|text| match PassRule::parse(text) {
                Ok(rule) => Clause::Rule {
                    text: text.to_string(),
                    rule,
                },
                Err(error) => Clause::Malformed {
                    text: text.to_string(),
                    error,
                },
            })
            .collect();
        Self { clauses }
    }

    /// True when the default `exit_code == 0` rule applies
    pub fn is_default(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Well-formed rules in evaluation order
    pub fn rules(&self) -> impl Iterator<Item = &PassRule> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Rule { rule, .. } => Some(rule),
            Clause::Malformed { .. } => None,
        })
    }

    /// Malformed clauses and why they were rejected
    pub fn malformed(&self) -> impl Iterator<Item = (&str, &RuleError)> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Malformed { text, error } => Some((text.as_str(), error)),
            Clause::Rule { .. } => None,
        })
    }

    pub fn evaluate(&self, output: &AttemptOutput<'_>) -> Verdict {
        if self.is_default() {
            return Verdict {
                passed: output.exit_code == 0,
                matched: format!("exit_code=={} (default)", output.exit_code),
            };
        }

        for clause in &self.clauses {
            match clause {
                Clause::Malformed { text, error } => {
                    debug!(clause = %text, error = %error, "Skipping malformed rule");
                }
                Clause::Rule { text, rule } => match rule.check(output) {
                    Ok(true) => {
                        return Verdict {
                            passed: true,
                            matched: text.clone(),
                        }
                    }
                    Ok(false) => {}
                    Err(e) => debug!(clause = %text, error = %e, "Rule check failed"),
                },
            }
        }

        Verdict {
            passed: false,
            matched: "no rule matched".to_string(),
        }
    }
}

/// Parse and evaluate `expression` in one go
pub fn evaluate(
    expression: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    workdir: &Path,
) -> Verdict {
    PassCriteria::parse(expression).evaluate(&AttemptOutput {
        exit_code,
        stdout,
        stderr,
        workdir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn eval(expr: &str, code: i32, stdout: &str, stderr: &str) -> Verdict {
        evaluate(expr, code, stdout, stderr, Path::new("/nonexistent"))
    }

    #[test]
    fn test_default_rule() {
        let v = eval("", 0, "", "");
        assert!(v.passed);
        assert_eq!(v.matched, "exit_code==0 (default)");

        let v = eval("   ", 3, "", "");
        assert!(!v.passed);
        assert_eq!(v.matched, "exit_code==3 (default)");
    }

    #[test]
    fn test_first_match_wins() {
        let v = eval("exit_code:1|stdout_contains:OK|stdout_regex:O.", 0, "all OK", "");
        assert!(v.passed);
        assert_eq!(v.matched, "stdout_contains:OK");
    }

    #[test]
    fn test_no_rule_matched() {
        let v = eval("exit_code:0|stderr_contains:boom", 1, "", "fine");
        assert_eq!(
            v,
            Verdict {
                passed: false,
                matched: "no rule matched".to_string()
            }
        );
    }

    #[test]
    fn test_stdout_rules() {
        assert!(eval("stdout_regex:^RESULT=PASS$", 1, "line1\nRESULT=PASS\nline3", "").passed);
        assert!(eval("stdout_equal:DONE", 1, "  DONE \n", "").passed);
        assert!(!eval("stdout_equal:DONE", 1, "DONE!", "").passed);
        assert!(eval("stderr_regex:warn\\d+", 1, "", "warn42").passed);
        assert!(eval("stderr_contains:ok", 1, "", "its ok").passed);
    }

    #[test]
    fn test_malformed_clause_is_skipped() {
        let v = eval("exit_code:abc|stdout_regex:(|bogus:1|exit_code: 2", 2, "", "");
        assert!(v.passed);
        assert_eq!(v.matched, "exit_code: 2");

        let criteria = PassCriteria::parse("exit_code:abc|stdout_regex:(|bogus:1|nocolon");
        assert_eq!(criteria.malformed().count(), 4);
        assert_eq!(criteria.rules().count(), 0);
    }

    #[test]
    fn test_file_rules() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "serial=SN1\nstatus=GOOD\n").unwrap();
        let abs = dir.path().join("out.txt");

        let run = |expr: &str| evaluate(expr, 1, "", "", dir.path());
        assert!(run("file_exists:out.txt").passed);
        assert!(run(&format!("file_exists:{}", abs.display())).passed);
        assert!(!run("file_exists:missing.txt").passed);
        assert!(run("file_contains:out.txt:status=GOOD").passed);
        assert!(!run("file_contains:out.txt:status=BAD").passed);
        assert!(!run("file_contains:missing.txt:x").passed);
    }

    #[test]
    fn test_json_field() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("r.json"),
            r#"{"result": {"status": "PASS", "count": 3, "ok": true}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), "{oops").unwrap();

        let run = |expr: &str| evaluate(expr, 1, "", "", dir.path());
        assert!(run("json_field:r.json:$.result.status=PASS").passed);
        assert!(run("json_field:r.json:$.result.count=3").passed);
        assert!(run("json_field:r.json:$.result.ok=true").passed);
        assert!(run("json_field:r.json:$.result.ok=True").passed);
        assert!(!run("json_field:r.json:$.result.ok=False").passed);
        assert!(!run("json_field:r.json:$.result.missing=PASS").passed);
        assert!(!run("json_field:r.json:result.status=PASS").passed);

        let v = run("json_field:bad.json:$.a=1|exit_code:1");
        assert!(v.passed);
        assert_eq!(v.matched, "exit_code:1");
    }

    #[test]
    fn test_junit_result() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("ok.xml"),
            r#"<testsuite name="s" tests="2" failures="0" errors="0"></testsuite>"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("fail.xml"),
            r#"<testsuite name="s" tests="2" failures="1" errors="0"></testsuite>"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.xml"), "<testsuite failures=").unwrap();

        let run = |expr: &str| evaluate(expr, 1, "", "", dir.path());
        assert!(run("junit_result:ok.xml=PASS").passed);
        assert!(run("junit_result:ok.xml=pass").passed);
        assert!(!run("junit_result:ok.xml=FAIL").passed);
        assert!(!run("junit_result:fail.xml=PASS").passed);
        assert!(!run("junit_result:broken.xml=PASS").passed);
    }
}
