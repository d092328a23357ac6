//! Run directory management
//!
//! Layout under the project root:
//!
//! ```text
//! runs/<sn>/
//!   .run.lock                  advisory lock held by the active orchestrator
//!   latest_run.json            resume pointer
//!   <run_id>/
//!     run_meta.json
//!     steps/<sid>/state.json
//!     steps/<sid>/step.log
//!     reports/report_<sn>_<run_id>.json
//! ```

use std::borrow::Cow;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::ExecutorError;
use super::flag_store::{read_json_tolerant, timestamp, write_json_atomic};
use super::result::ReportRow;

const POINTER_FILE: &str = "latest_run.json";
const LOCK_FILE: &str = ".run.lock";
const META_FILE: &str = "run_meta.json";
const STEP_LOG_FILE: &str = "step.log";

/// Coarse run status recorded in the resume pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerStatus {
    Running,
    Pending,
    FinishedPass,
    FinishedFail,
    Stopped,
}

impl PointerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerStatus::Running => "running",
            PointerStatus::Pending => "pending",
            PointerStatus::FinishedPass => "finished_pass",
            PointerStatus::FinishedFail => "finished_fail",
            PointerStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(PointerStatus::Running),
            "pending" => Some(PointerStatus::Pending),
            "finished_pass" => Some(PointerStatus::FinishedPass),
            "finished_fail" => Some(PointerStatus::FinishedFail),
            "stopped" => Some(PointerStatus::Stopped),
            _ => None,
        }
    }

    /// Runs in these states are picked up again by the next orchestrator
    pub fn is_resumable(&self) -> bool {
        matches!(self, PointerStatus::Running | PointerStatus::Pending)
    }
}

impl fmt::Display for PointerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `latest_run.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestRun {
    pub sn: String,
    pub run_id: String,
    /// `None` when the stored status is missing or unrecognised
    pub status: Option<PointerStatus>,
    pub updated_at: String,
}

impl LatestRun {
    /// Read the pointer for a serial directory; corruption reads as absence
    pub fn read(sn_dir: &Path) -> Option<Self> {
        let Value::Object(data) = read_json_tolerant(&sn_dir.join(POINTER_FILE))? else {
            return None;
        };
        let text = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };
        let run_id = text("run_id");
        if run_id.is_empty() {
            return None;
        }
        Some(Self {
            sn: text("sn"),
            run_id,
            status: PointerStatus::parse(&text("status")),
            updated_at: text("updated_at"),
        })
    }

    /// Whether this pointer names a run that `sn` should resume
    fn resumable_for(&self, sn: &str, sn_dir: &Path) -> bool {
        let same_unit = self.sn.is_empty() || self.sn == sn;
        let live = self.status.is_some_and(|s| s.is_resumable());
        same_unit && live && is_plain_name(&self.run_id) && sn_dir.join(&self.run_id).is_dir()
    }
}

/// Which existing run a new handle may attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// Resume only a run whose pointer is `running` or `pending`
    Resumable,
    /// Attach to the latest run whatever its status (operator tools)
    Latest,
}

/// A prepared run directory, locked for the lifetime of this value
#[derive(Debug)]
pub struct RunDirectory {
    sn: String,
    sn_dir: PathBuf,
    run_id: String,
    path: PathBuf,
    resumed: bool,
    _lock: File,
}

impl RunDirectory {
    /// Resume or create the run directory for `sn` under `runs_root`
    pub fn prepare(runs_root: &Path, sn: &str, attach: Attach) -> Result<Self, ExecutorError> {
        let sn = sn.trim();
        if !is_plain_name(sn) {
            return Err(ExecutorError::InvalidSerial(sn.to_string()));
        }

        let sn_dir = runs_root.join(sn);
        fs::create_dir_all(&sn_dir)?;
        let lock = acquire_lock(&sn_dir, sn)?;

        let previous = LatestRun::read(&sn_dir).filter(|latest| match attach {
            Attach::Resumable => latest.resumable_for(sn, &sn_dir),
            Attach::Latest => is_plain_name(&latest.run_id) && sn_dir.join(&latest.run_id).is_dir(),
        });

        let (run_id, resumed) = match previous {
            Some(latest) => {
                info!(sn, run_id = %latest.run_id, status = ?latest.status, "Resuming run");
                (latest.run_id, true)
            }
            None => (fresh_run_id(&sn_dir), false),
        };

        let path = sn_dir.join(&run_id);
        fs::create_dir_all(path.join("steps"))?;
        fs::create_dir_all(path.join("reports"))?;

        let dir = Self {
            sn: sn.to_string(),
            sn_dir,
            run_id,
            path,
            resumed,
            _lock: lock,
        };
        dir.try_write_pointer(PointerStatus::Running)?;
        Ok(dir)
    }

    pub fn sn(&self) -> &str {
        &self.sn
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.sn_dir.join(POINTER_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }

    pub fn step_dir(&self, sid: &str) -> PathBuf {
        self.path.join("steps").join(sid)
    }

    pub fn step_log_path(&self, sid: &str) -> PathBuf {
        self.step_dir(sid).join(STEP_LOG_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.path
            .join("reports")
            .join(format!("report_{}_{}.json", self.sn, self.run_id))
    }

    fn try_write_pointer(&self, status: PointerStatus) -> io::Result<()> {
        let record = serde_json::json!({
            "sn": self.sn,
            "run_id": self.run_id,
            "status": status.as_str(),
            "updated_at": timestamp(),
        });
        write_json_atomic(&self.pointer_path(), &record)
    }

    /// Update the resume pointer; failures are logged, not raised
    pub fn write_pointer(&self, status: PointerStatus) {
        match self.try_write_pointer(status) {
            Ok(()) => debug!(status = %status, "Run pointer updated"),
            Err(e) => warn!(error = %e, status = %status, "Failed to update run pointer"),
        }
    }

    /// Best-effort run snapshot
    pub fn write_meta<T: Serialize>(&self, meta: &T) {
        if let Err(e) = write_json_atomic(&self.meta_path(), meta) {
            warn!(error = %e, "Failed to write run metadata");
        }
    }

    pub fn write_report(&self, rows: &[ReportRow]) -> io::Result<PathBuf> {
        let path = self.report_path();
        write_json_atomic(&path, rows)?;
        Ok(path)
    }

    /// Append a chunk to a step's log; failures are logged, not raised
    pub fn append_step_log(&self, sid: &str, chunk: &str) {
        let path = self.step_log_path(sid);
        let result = fs::create_dir_all(self.step_dir(sid)).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(chunk.as_bytes())
        });
        if let Err(e) = result {
            warn!(sid, error = %e, "Failed to append step log");
        }
    }
}

/// Read-only view of the latest run for a serial number (no lock taken)
pub fn latest_run(runs_root: &Path, sn: &str) -> Option<LatestRun> {
    LatestRun::read(&runs_root.join(sn.trim()))
}

/// Text appended to `step.log` for one attempt
pub fn attempt_log_chunk(
    attempt: u32,
    state: impl fmt::Display,
    exit_code: Option<i32>,
    duration_s: f64,
    stdout: &str,
    stderr: &str,
) -> String {
    let code = exit_code.map(|c| c.to_string()).unwrap_or_default();
    format!(
        "\n===== Attempt {} @ {} =====\nState: {} | Exit Code: {} | Duration: {:.2}s\n[STDOUT]\n{}[STDERR]\n{}",
        attempt,
        timestamp(),
        state,
        code,
        duration_s,
        terminated(stdout),
        terminated(stderr)
    )
}

fn terminated(text: &str) -> Cow<'_, str> {
    if text.ends_with('\n') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{}\n", text))
    }
}

fn acquire_lock(sn_dir: &Path, sn: &str) -> Result<File, ExecutorError> {
    let path = sn_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;
    if let Err(e) = file.try_lock_exclusive() {
        debug!(path = %path.display(), error = %e, "Run lock is held");
        return Err(ExecutorError::RunLocked {
            sn: sn.to_string(),
            path,
        });
    }
    Ok(file)
}

fn fresh_run_id(sn_dir: &Path) -> String {
    let base = Local::now().format("%Y%m%d_%H%M%S").to_string();
    if !sn_dir.join(&base).exists() {
        return base;
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !sn_dir.join(candidate).exists())
        .unwrap_or(base)
}

/// A single normal path component (no separators, not `.`/`..`)
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && Path::new(name).components().count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_run_creates_layout_and_pointer() {
        let root = tempdir().unwrap();
        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();

        assert!(!dir.is_resumed());
        assert!(dir.path().join("steps").is_dir());
        assert!(dir.path().join("reports").is_dir());

        let latest = latest_run(root.path(), "SN001").unwrap();
        assert_eq!(latest.run_id, dir.run_id());
        assert_eq!(latest.sn, "SN001");
        assert_eq!(latest.status, Some(PointerStatus::Running));
    }

    #[test]
    fn test_lock_rejects_second_instance() {
        let root = tempdir().unwrap();
        let first = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        let second = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable);
        assert!(matches!(second, Err(ExecutorError::RunLocked { .. })));

        // Other serial numbers are unaffected
        RunDirectory::prepare(root.path(), "SN002", Attach::Resumable).unwrap();

        drop(first);
        RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
    }

    #[test]
    fn test_resume_running_and_pending() {
        let root = tempdir().unwrap();
        let run_id = {
            let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
            dir.write_pointer(PointerStatus::Pending);
            dir.run_id().to_string()
        };

        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        assert!(dir.is_resumed());
        assert_eq!(dir.run_id(), run_id);
    }

    #[test]
    fn test_finished_run_starts_fresh() {
        let root = tempdir().unwrap();
        let run_id = {
            let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
            dir.write_pointer(PointerStatus::FinishedPass);
            dir.run_id().to_string()
        };

        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        assert!(!dir.is_resumed());
        assert_ne!(dir.run_id(), run_id);
        drop(dir);

        // Operator tools may still attach to it
        let pointer = latest_run(root.path(), "SN001").unwrap();
        let attached = RunDirectory::prepare(root.path(), "SN001", Attach::Latest).unwrap();
        assert_eq!(attached.run_id(), pointer.run_id);
        assert!(attached.is_resumed());
    }

    #[test]
    fn test_pointer_to_missing_dir_is_ignored() {
        let root = tempdir().unwrap();
        let sn_dir = root.path().join("SN001");
        fs::create_dir_all(&sn_dir).unwrap();
        fs::write(
            sn_dir.join(POINTER_FILE),
            r#"{"sn": "SN001", "run_id": "20200101_000000", "status": "running"}"#,
        )
        .unwrap();

        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        assert!(!dir.is_resumed());
        assert_ne!(dir.run_id(), "20200101_000000");
    }

    #[test]
    fn test_pointer_for_other_unit_is_ignored() {
        let root = tempdir().unwrap();
        let sn_dir = root.path().join("SN001");
        fs::create_dir_all(sn_dir.join("20200101_000000")).unwrap();
        fs::write(
            sn_dir.join(POINTER_FILE),
            r#"{"sn": "SN999", "run_id": "20200101_000000", "status": "running"}"#,
        )
        .unwrap();

        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        assert!(!dir.is_resumed());
    }

    #[test]
    fn test_corrupt_pointer_is_absence() {
        let root = tempdir().unwrap();
        let sn_dir = root.path().join("SN001");
        fs::create_dir_all(&sn_dir).unwrap();
        fs::write(sn_dir.join(POINTER_FILE), "{{{").unwrap();

        assert!(latest_run(root.path(), "SN001").is_none());
        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        assert!(!dir.is_resumed());
    }

    #[test]
    fn test_fresh_id_collision_gets_suffix() {
        let root = tempdir().unwrap();
        let sn_dir = root.path().join("SN001");
        let base = Local::now().format("%Y%m%d_%H%M%S").to_string();
        fs::create_dir_all(sn_dir.join(&base)).unwrap();

        let id = fresh_run_id(&sn_dir);
        // The clock may tick between the two calls
        assert!(id == format!("{}_1", base) || id != base);
    }

    #[test]
    fn test_invalid_serial_numbers() {
        let root = tempdir().unwrap();
        for sn in ["", "  ", "..", "a/b", "a\\b"] {
            assert!(matches!(
                RunDirectory::prepare(root.path(), sn, Attach::Resumable),
                Err(ExecutorError::InvalidSerial(_))
            ));
        }
    }

    #[test]
    fn test_step_log_appends() {
        let root = tempdir().unwrap();
        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        dir.append_step_log("10_Power", &attempt_log_chunk(1, "FAIL", Some(1), 0.5, "out", "err"));
        dir.append_step_log("10_Power", &attempt_log_chunk(2, "PASS", Some(0), 0.25, "ok", ""));

        let log = fs::read_to_string(dir.step_log_path("10_Power")).unwrap();
        assert!(log.contains("===== Attempt 1 @"));
        assert!(log.contains("State: FAIL | Exit Code: 1 | Duration: 0.50s"));
        assert!(log.contains("===== Attempt 2 @"));
        assert!(log.find("Attempt 1").unwrap() < log.find("Attempt 2").unwrap());
    }

    #[test]
    fn test_attempt_chunk_terminates_output_once() {
        let chunk = attempt_log_chunk(1, "PASS", Some(0), 0.1, "line\n", "warn");
        assert!(chunk.contains("[STDOUT]\nline\n[STDERR]\nwarn\n"));
        assert!(!chunk.contains("line\n\n"));
        assert!(chunk.ends_with("warn\n"));
    }

    #[test]
    fn test_report_path() {
        let root = tempdir().unwrap();
        let dir = RunDirectory::prepare(root.path(), "SN001", Attach::Resumable).unwrap();
        let path = dir.write_report(&[]).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("report_SN001_{}.json", dir.run_id())
        );
        assert_eq!(fs::read_to_string(path).unwrap().trim(), "[]");
    }
}
