//! Flag store - durable per-step outcomes
//!
//! Each step owns `steps/<sid>/state.json` inside the run directory. Writes go
//! to a temp file first and are renamed into place, so a crash never leaves a
//! half-written flag visible. Reads are tolerant: a missing, unreadable, or
//! invalid file reads as "no flag".

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::result::StepState;

const FLAG_FILE: &str = "state.json";
const KNOWN_KEYS: [&str; 6] = ["step_id", "status", "updated_at", "note", "attempt", "extra"];
/// Extra keys kept only inside `extra` and not mirrored at the top level
const NESTED_ONLY_KEYS: [&str; 2] = ["exit_code", "matched_rule"];

/// Timestamp format used by flags, pointers, and run snapshots
pub(crate) fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Serialize `value` as pretty JSON to `path` via temp file + rename
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data.json");
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read a JSON file, treating absence and corruption alike as `None`
pub(crate) fn read_json_tolerant(path: &Path) -> Option<Value> {
    let bytes = fs::read(path).ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim_start_matches('\u{feff}');
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring unparsable JSON file");
            None
        }
    }
}

/// Last known outcome of a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepFlag {
    pub step_id: String,
    pub status: StepState,
    pub updated_at: String,
    pub note: String,
    pub attempt: u32,
    /// Open payload (last exit code, matched rule, unknown fields)
    pub extra: Map<String, Value>,
}

impl StepFlag {
    pub fn is_pass(&self) -> bool {
        self.status == StepState::Pass
    }

    pub fn is_fail(&self) -> bool {
        self.status.is_failure()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.extra
            .get("exit_code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
    }

    pub fn matched_rule(&self) -> Option<&str> {
        self.extra.get("matched_rule").and_then(Value::as_str)
    }

    fn from_value(step_id: &str, data: Value) -> Option<Self> {
        let Value::Object(data) = data else {
            return None;
        };

        let status = data
            .get("status")
            .map(value_to_string)
            .map(|s| StepState::from_persisted(&s))
            .unwrap_or_default();

        let mut extra = match data.get("extra") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in &data {
            if !KNOWN_KEYS.contains(&key.as_str()) && !extra.contains_key(key) {
                extra.insert(key.clone(), value.clone());
            }
        }

        let attempt = match data.get("attempt") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };

        Some(Self {
            step_id: step_id.to_string(),
            status,
            updated_at: data.get("updated_at").map(value_to_string).unwrap_or_default(),
            note: data.get("note").map(value_to_string).unwrap_or_default(),
            attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
            extra,
        })
    }

    fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("step_id".into(), Value::String(self.step_id.clone()));
        record.insert("status".into(), Value::String(self.status.as_str().to_string()));
        record.insert("updated_at".into(), Value::String(self.updated_at.clone()));
        record.insert("note".into(), Value::String(self.note.clone()));
        record.insert("attempt".into(), Value::from(self.attempt));
        record.insert("extra".into(), Value::Object(self.extra.clone()));
        for (key, value) in &self.extra {
            if NESTED_ONLY_KEYS.contains(&key.as_str()) || KNOWN_KEYS.contains(&key.as_str()) {
                continue;
            }
            record.insert(key.clone(), value.clone());
        }
        Value::Object(record)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Per-run store of step flags
#[derive(Debug, Clone)]
pub struct FlagStore {
    steps_dir: PathBuf,
}

impl FlagStore {
    pub fn new(run_dir: impl AsRef<Path>) -> Self {
        Self {
            steps_dir: run_dir.as_ref().join("steps"),
        }
    }

    pub fn steps_dir(&self) -> &Path {
        &self.steps_dir
    }

    pub fn flag_path(&self, sid: &str) -> PathBuf {
        self.steps_dir.join(sid).join(FLAG_FILE)
    }

    /// Read the flag for `sid` straight from storage
    pub fn read(&self, sid: &str) -> Option<StepFlag> {
        let value = read_json_tolerant(&self.flag_path(sid))?;
        StepFlag::from_value(sid, value)
    }

    /// Persist a flag; null values in `extra` are dropped
    pub fn write(
        &self,
        sid: &str,
        status: StepState,
        note: &str,
        attempt: u32,
        extra: Map<String, Value>,
    ) -> io::Result<StepFlag> {
        let flag = StepFlag {
            step_id: sid.to_string(),
            status,
            updated_at: timestamp(),
            note: note.to_string(),
            attempt,
            extra: extra.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        };
        write_json_atomic(&self.flag_path(sid), &flag.to_record())?;
        debug!(sid, status = %status, "Flag written");
        Ok(flag)
    }

    /// Delete one flag file; a missing file is not an error
    pub fn remove(&self, sid: &str) {
        remove_quietly(&self.flag_path(sid));
    }

    /// Every readable flag under the run directory
    pub fn load_all(&self) -> HashMap<String, StepFlag> {
        let mut flags = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.steps_dir) else {
            return flags;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(sid) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(flag) = self.read(sid) {
                flags.insert(flag.step_id.clone(), flag);
            }
        }
        flags
    }

    /// Delete every step's flag file, best effort
    pub fn reset_all(&self) {
        let Ok(entries) = fs::read_dir(&self.steps_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                remove_quietly(&path.join(FLAG_FILE));
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove flag file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn extra(pairs: Value) -> Map<String, Value> {
        match pairs {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = FlagStore::new(dir.path());

        let written = store
            .write(
                "10_Power",
                StepState::Pass,
                "ok",
                2,
                extra(json!({"exit_code": 0, "matched_rule": "exit_code:0", "fixture": "A1"})),
            )
            .unwrap();

        let read = store.read("10_Power").unwrap();
        assert_eq!(read, written);
        assert!(read.is_pass());
        assert_eq!(read.exit_code(), Some(0));
        assert_eq!(read.matched_rule(), Some("exit_code:0"));

        let raw: Value = serde_json::from_str(&fs::read_to_string(store.flag_path("10_Power")).unwrap()).unwrap();
        assert_eq!(raw["fixture"], json!("A1"));
        assert!(raw.get("exit_code").is_none());
        assert!(!store.flag_path("10_Power").with_file_name("state.json.tmp").exists());
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let store = FlagStore::new(dir.path());
        assert!(store.read("10_Power").is_none());

        let path = store.flag_path("10_Power");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(store.read("10_Power").is_none());

        fs::write(&path, "[1, 2]").unwrap();
        assert!(store.read("10_Power").is_none());
    }

    #[test]
    fn test_unknown_status_and_fields() {
        let dir = tempdir().unwrap();
        let store = FlagStore::new(dir.path());
        let path = store.flag_path("20_Flash");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "\u{feff}{\"status\": \"exploded\", \"attempt\": \"3\", \"operator\": \"amy\", \"extra\": {\"exit_code\": 5}}",
        )
        .unwrap();

        let flag = store.read("20_Flash").unwrap();
        assert_eq!(flag.status, StepState::NotRun);
        assert_eq!(flag.attempt, 3);
        assert_eq!(flag.extra.get("operator"), Some(&json!("amy")));
        assert_eq!(flag.exit_code(), Some(5));
    }

    #[test]
    fn test_write_drops_null_extra() {
        let dir = tempdir().unwrap();
        let store = FlagStore::new(dir.path());
        let flag = store
            .write("10_Power", StepState::Fail, "", 1, extra(json!({"exit_code": null, "k": 1})))
            .unwrap();
        assert!(!flag.extra.contains_key("exit_code"));
        assert!(flag.is_fail());
    }

    #[test]
    fn test_load_all_and_reset_all() {
        let dir = tempdir().unwrap();
        let store = FlagStore::new(dir.path());
        store.write("10_Power", StepState::Pass, "", 1, Map::new()).unwrap();
        store.write("20_Flash", StepState::Timeout, "", 2, Map::new()).unwrap();
        fs::create_dir_all(store.steps_dir().join("30_Empty")).unwrap();
        fs::write(store.steps_dir().join("stray.txt"), "x").unwrap();

        let flags = store.load_all();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags["20_Flash"].status, StepState::Timeout);

        store.reset_all();
        assert!(store.load_all().is_empty());
        store.reset_all();
    }

    #[test]
    fn test_load_all_without_steps_dir() {
        let dir = tempdir().unwrap();
        let store = FlagStore::new(dir.path().join("missing"));
        assert!(store.load_all().is_empty());
        store.reset_all();
        store.remove("10_Power");
    }
}
