//! Orchestrator - runs a station sequence for one serial number
//!
//! This is the main engine that:
//! 1. Prepares or resumes the run directory for the serial number
//! 2. Executes steps in ascending order with retry, timeout, and kill-tree handling
//! 3. Skips steps whose persisted flag already holds a resolved outcome
//! 4. Judges each attempt with the step's pass criteria
//! 5. Persists flags, the run snapshot, the resume pointer, and the report

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::engine::control::RunControl;
use crate::engine::error::ExecutorError;
use crate::engine::evaluator::{AttemptOutput, PassCriteria, PassRule};
use crate::engine::events::{EventBus, RunEvent};
use crate::engine::flag_store::{timestamp, FlagStore, StepFlag};
use crate::engine::process::{self, encoding_for, ProcessExit, ProcessSpec};
use crate::engine::result::{ReportRow, RunStatus, StepResult, StepState};
use crate::engine::run_dir::{attempt_log_chunk, Attach, PointerStatus, RunDirectory};
use crate::sequence::{PlaceholderContext, RunMode, StationConfig, StepSpec};

/// Per-instance options
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Serial number of the unit under test
    pub sn: String,
    /// Recorded in the run snapshot
    pub debug: bool,
}

impl OrchestratorOptions {
    pub fn new(sn: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            debug: false,
        }
    }
}

/// What `run_all` ended with
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub pointer: PointerStatus,
    /// Report file, when the report policy asked for one
    pub report: Option<PathBuf>,
}

/// One step as recorded in `run_meta.json`
#[derive(Debug, Clone, Serialize)]
struct ManifestEntry {
    id: String,
    order: i64,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    cmd: String,
    workdir: String,
    timeout: u64,
    retry: u32,
    retry_interval_sec: u64,
    ignore_result: bool,
    pass_by: String,
    kill_tree: bool,
    stdout_encoding: String,
    artifacts: Vec<String>,
    pending_exit_codes: Vec<i32>,
    flag_status: StepState,
    flag_path: String,
    flag_updated_at: String,
}

impl ManifestEntry {
    fn new(step: &StepSpec, default_timeout: u64, store: &FlagStore, flag: Option<&StepFlag>) -> Self {
        let sid = step.sid();
        let mut entry = Self {
            flag_path: store.flag_path(&sid).display().to_string(),
            id: sid,
            order: step.order,
            name: step.name.clone(),
            kind: step.kind.clone(),
            cmd: step.cmd.clone(),
            workdir: step.workdir.clone(),
            timeout: step.timeout_secs(default_timeout),
            retry: step.retry,
            retry_interval_sec: step.retry_interval_sec,
            ignore_result: step.ignore_result,
            pass_by: step.pass_by.clone(),
            kill_tree: step.kill_tree,
            stdout_encoding: step.stdout_encoding.clone(),
            artifacts: step.artifacts.clone(),
            pending_exit_codes: step.pending_exit_codes.clone(),
            flag_status: StepState::NotRun,
            flag_updated_at: String::new(),
        };
        entry.apply_flag(flag);
        entry
    }

    fn apply_flag(&mut self, flag: Option<&StepFlag>) {
        match flag {
            Some(flag) => {
                self.flag_status = flag.status;
                self.flag_updated_at = flag.updated_at.clone();
            }
            None => {
                self.flag_status = StepState::NotRun;
                self.flag_updated_at.clear();
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct RunContext {
    config_path: Option<String>,
    project_root: String,
    run_dir: String,
    debug: bool,
}

#[derive(Debug, Serialize)]
struct RunMeta<'a> {
    sn: &'a str,
    run_id: &'a str,
    timestamp: String,
    run_mode: String,
    debug: bool,
    global_status: RunStatus,
    station: BTreeMap<String, String>,
    run_context: RunContext,
    steps_manifest: &'a [ManifestEntry],
}

/// Outcome of one attempt before retry/ignore policy is applied
struct AttemptOutcome {
    state: StepState,
    exit_code: Option<i32>,
    matched_rule: String,
    note: String,
    duration_s: f64,
    stdout: String,
    stderr: String,
}

/// Runs a station sequence for one serial number
pub struct Orchestrator {
    config: StationConfig,
    debug: bool,
    run_dir: RunDirectory,
    store: FlagStore,
    flags: HashMap<String, StepFlag>,
    results: HashMap<String, StepResult>,
    manifest: Vec<ManifestEntry>,
    placeholders: PlaceholderContext,
    status: RunStatus,
    control: RunControl,
    events: EventBus,
}

impl Orchestrator {
    /// Prepare (or resume) the run directory for `options.sn` and load its flags
    pub fn new(config: StationConfig, options: OrchestratorOptions) -> Result<Self, ExecutorError> {
        Self::build(config, options, Attach::Resumable)
    }

    /// Attach to the latest run for the serial number whatever its status.
    ///
    /// Used by operator tools (status, reset) that act on a finished run.
    pub fn attach_latest(
        config: StationConfig,
        options: OrchestratorOptions,
    ) -> Result<Self, ExecutorError> {
        Self::build(config, options, Attach::Latest)
    }

    fn build(
        config: StationConfig,
        options: OrchestratorOptions,
        attach: Attach,
    ) -> Result<Self, ExecutorError> {
        if config.steps.is_empty() {
            warn!("Station configuration has no steps");
        }
        for diagnostic in config.validate() {
            warn!("Malformed pass rule: {}", diagnostic);
        }

        let run_dir = RunDirectory::prepare(&config.runs_root(), &options.sn, attach)?;
        let store = FlagStore::new(run_dir.path());
        let flags = store.load_all();

        let default_timeout = config.run.default_timeout_sec;
        let manifest = config
            .steps
            .iter()
            .map(|step| ManifestEntry::new(step, default_timeout, &store, flags.get(&step.sid())))
            .collect();

        let results = config
            .steps
            .iter()
            .map(|step| {
                let sid = step.sid();
                let result = match flags.get(&sid) {
                    Some(flag) => StepResult {
                        state: flag.status,
                        note: flag.note.clone(),
                        attempt: flag.attempt,
                        exit_code: flag.exit_code(),
                        matched_rule: flag.matched_rule().unwrap_or_default().to_string(),
                        ..Default::default()
                    },
                    None => StepResult::default(),
                };
                (sid, result)
            })
            .collect();

        let absolute_run_dir =
            fs::canonicalize(run_dir.path()).unwrap_or_else(|_| run_dir.path().to_path_buf());
        let placeholders = PlaceholderContext::new()
            .with("SN", run_dir.sn())
            .with("RUN_ID", run_dir.run_id())
            .with("RUN_DIR", absolute_run_dir.display().to_string())
            .with("TOOLS_DIR", config.tools_dir().display().to_string());

        let events = EventBus::default();
        let control = RunControl::new(events.clone());

        info!(
            sn = run_dir.sn(),
            run_id = run_dir.run_id(),
            resumed = run_dir.is_resumed(),
            flags = flags.len(),
            "Run directory ready: {}",
            run_dir.path().display()
        );

        let orchestrator = Self {
            config,
            debug: options.debug,
            run_dir,
            store,
            flags,
            results,
            manifest,
            placeholders,
            status: RunStatus::Ready,
            control,
            events,
        };
        orchestrator.write_run_meta();
        Ok(orchestrator)
    }

    pub fn sn(&self) -> &str {
        self.run_dir.sn()
    }

    pub fn run_id(&self) -> &str {
        self.run_dir.run_id()
    }

    pub fn run_dir(&self) -> &Path {
        self.run_dir.path()
    }

    pub fn is_resumed(&self) -> bool {
        self.run_dir.is_resumed()
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.config.steps
    }

    /// Current run status; `Paused` while a running sequence is held
    pub fn status(&self) -> RunStatus {
        if self.status == RunStatus::Running && self.control.is_paused() {
            RunStatus::Paused
        } else {
            self.status
        }
    }

    pub fn results(&self) -> &HashMap<String, StepResult> {
        &self.results
    }

    pub fn result(&self, sid: &str) -> Option<&StepResult> {
        self.results.get(sid)
    }

    pub fn flags(&self) -> &HashMap<String, StepFlag> {
        &self.flags
    }

    pub fn flag_store(&self) -> &FlagStore {
        &self.store
    }

    /// Cloneable pause/resume/stop handle
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.events.status_changed(status);
    }

    /// Execute the sequence until it completes, fails, pends, or is stopped
    #[instrument(skip(self), fields(sn = %self.run_dir.sn(), run_id = %self.run_dir.run_id()))]
    pub async fn run_all(&mut self) -> RunSummary {
        info!(
            steps = self.config.steps.len(),
            run_mode = %self.config.run.run_mode,
            "Starting run"
        );
        self.set_status(RunStatus::Running);
        self.run_dir.write_pointer(PointerStatus::Running);
        self.write_run_meta();

        let steps = self.config.steps.clone();
        let mut stopped_on_fail = false;
        let mut pending = false;
        let mut completed = true;

        for step in &steps {
            let result = self.run_step(step).await;
            let state = result.state;
            self.results.insert(step.sid(), result);

            if self.control.is_stop_requested() {
                info!("Run stopped by operator after {}", step.sid());
                self.status = RunStatus::Stopped;
                completed = false;
                break;
            }

            if state == StepState::Running {
                info!("Step {} is pending external validation", step.sid());
                pending = true;
                self.status = RunStatus::Running;
                completed = false;
                break;
            }

            if state.is_failure()
                && !step.ignore_result
                && self.config.run.run_mode == RunMode::StopOnFail
            {
                warn!("Step {} ended {}, skipping remaining steps", step.sid(), state);
                self.mark_remaining_skipped(step.order);
                stopped_on_fail = true;
                self.status = RunStatus::Fail;
                completed = false;
                break;
            }
        }

        if completed {
            let failed = steps.iter().any(|step| {
                !step.ignore_result
                    && self
                        .results
                        .get(&step.sid())
                        .is_some_and(|r| r.state.is_failure())
            });
            self.status = if failed { RunStatus::Fail } else { RunStatus::Pass };
        }
        self.events.status_changed(self.status);

        let pointer = if pending {
            PointerStatus::Pending
        } else {
            match self.status {
                RunStatus::Pass => PointerStatus::FinishedPass,
                RunStatus::Fail => PointerStatus::FinishedFail,
                RunStatus::Stopped => PointerStatus::Stopped,
                _ => PointerStatus::Running,
            }
        };

        self.write_run_meta();
        self.run_dir.write_pointer(pointer);

        let report = if self.config.run.report_emit_on.should_emit(stopped_on_fail) {
            self.emit_report()
        } else {
            None
        };

        info!(status = %self.status, pointer = %pointer, "Run finished");
        RunSummary {
            status: self.status,
            pointer,
            report,
        }
    }

    /// Remove every persisted flag so a finished unit can be re-tested
    #[instrument(skip(self), fields(sn = %self.run_dir.sn(), run_id = %self.run_dir.run_id()))]
    pub fn reset_step_flags(&mut self) {
        self.store.reset_all();
        self.flags.clear();
        for result in self.results.values_mut() {
            *result = StepResult::default();
        }
        for entry in &mut self.manifest {
            entry.apply_flag(None);
        }
        self.run_dir.write_pointer(PointerStatus::Running);
        self.write_run_meta();
        info!("All step flags cleared");
    }

    #[instrument(skip(self, step), fields(sid = %step.sid()))]
    async fn run_step(&mut self, step: &StepSpec) -> StepResult {
        let sid = step.sid();

        if let Some(flag) = self.store.read(&sid).filter(|f| f.status.is_resolved()) {
            return self.resume_from_flag(&sid, flag);
        }

        let workdir = self.config.step_workdir(step);
        let step_dir = self.run_dir.step_dir(&sid);
        if let Err(e) = fs::create_dir_all(&step_dir) {
            warn!(error = %e, "Failed to create step directory {}", step_dir.display());
        }

        let ctx = self.placeholders.scoped(&[
            ("STEP_ID", sid.clone()),
            ("STEP_NAME", step.name.clone()),
            ("STEP_ORDER", step.order.to_string()),
            ("STEP_DIR", step_dir.display().to_string()),
            ("WORKDIR", workdir.display().to_string()),
        ]);
        let command = ctx.expand(&step.cmd);
        let criteria = PassCriteria::parse(&step.pass_by);
        let timeout = match step.timeout_secs(self.config.run.default_timeout_sec) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let encoding = encoding_for(&step.stdout_encoding);
        let attempts = step.retry.saturating_add(1);

        info!("Executing step: {}", sid);
        self.events.step_started(&sid);

        let mut result = StepResult::default();
        for attempt in 1..=attempts {
            if self.control.is_stop_requested() || self.control.wait_while_paused().await {
                result.state = StepState::Skipped;
                result.note = format!("stopped before attempt {}", attempt);
                break;
            }

            result.attempt = attempt;
            self.events.log_line(format!(
                "\n========== Enter {} (attempt {}/{}) ==========\n",
                sid, attempt, attempts
            ));

            let outcome = self
                .run_attempt(step, &command, &workdir, &criteria, timeout, encoding)
                .await;

            let chunk = attempt_log_chunk(
                attempt,
                outcome.state,
                outcome.exit_code,
                outcome.duration_s,
                &outcome.stdout,
                &outcome.stderr,
            );
            self.run_dir.append_step_log(&sid, &chunk);
            result.log.push_str(&chunk);

            result.state = outcome.state;
            result.exit_code = outcome.exit_code;
            result.matched_rule = outcome.matched_rule;
            result.note = outcome.note;
            result.duration_s = outcome.duration_s;

            if step.ignore_result && result.state.is_failure() {
                result.note = format!("ignored underlying={}", result.state);
                result.state = StepState::Pass;
            }

            info!(
                attempt,
                state = %result.state,
                exit_code = ?result.exit_code,
                "Attempt finished: {}",
                result.matched_rule
            );

            if matches!(result.state, StepState::Pass | StepState::Running) {
                break;
            }

            if attempt < attempts {
                let interval = Duration::from_secs(step.retry_interval_sec);
                debug!(?interval, "Retrying after failure");
                if self.control.sleep_unless_stopped(interval).await {
                    debug!("Stop requested during retry interval");
                }
            }
        }

        self.persist_outcome(&sid, &result);

        if result.state != StepState::Skipped {
            self.report_missing_artifacts(step, &ctx, &workdir);
        }

        self.events.log_line(format!(
            "========== End {} => {} ==========\n",
            sid, result.state
        ));
        self.events.step_finished(&sid, &result);
        result
    }

    /// A resolved flag short-circuits execution
    fn resume_from_flag(&mut self, sid: &str, flag: StepFlag) -> StepResult {
        let note = if flag.note.is_empty() {
            format!("resume flag={}", flag.status)
        } else {
            flag.note.clone()
        };
        let result = StepResult {
            state: flag.status,
            exit_code: flag.exit_code(),
            matched_rule: flag.matched_rule().unwrap_or_default().to_string(),
            attempt: flag.attempt,
            note,
            ..Default::default()
        };

        info!("Step {} already flagged {}, skipping execution", sid, flag.status);
        self.events.step_started(sid);
        self.events.log_line(format!(
            "[RESUME] {} flagged as {}, skip execution.\n",
            sid, flag.status
        ));
        self.update_manifest(sid, Some(&flag));
        self.flags.insert(sid.to_string(), flag);
        self.events.step_finished(sid, &result);
        result
    }

    async fn run_attempt(
        &self,
        step: &StepSpec,
        command: &str,
        workdir: &Path,
        criteria: &PassCriteria,
        timeout: Option<Duration>,
        encoding: &'static encoding_rs::Encoding,
    ) -> AttemptOutcome {
        let spec = ProcessSpec {
            command,
            workdir,
            timeout,
            kill_tree: step.kill_tree,
            encoding,
        };

        let output = match process::run_command(&spec, &self.events).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Failed to spawn command");
                let message = format!("spawn failed: {}", e);
                self.events.log_line(format!("[ERROR] {}\n", message));
                return AttemptOutcome {
                    state: StepState::Fail,
                    exit_code: None,
                    matched_rule: message,
                    note: String::new(),
                    duration_s: 0.0,
                    stdout: String::new(),
                    stderr: e.to_string(),
                };
            }
        };

        let duration_s = round_secs(output.duration);
        let (state, exit_code, matched_rule, note) = match output.exit {
            ProcessExit::TimedOut => (StepState::Timeout, Some(-1), "timeout".to_string(), String::new()),
            ProcessExit::Exited(code) => {
                let verdict = criteria.evaluate(&AttemptOutput {
                    exit_code: code,
                    stdout: &output.stdout,
                    stderr: &output.stderr,
                    workdir,
                });
                self.log_file_contains(criteria, workdir);

                if step.is_pending_code(code) {
                    (
                        StepState::Running,
                        Some(code),
                        verdict.matched,
                        format!("pending exit code {}", code),
                    )
                } else if verdict.passed {
                    (StepState::Pass, Some(code), verdict.matched, String::new())
                } else {
                    (StepState::Fail, Some(code), verdict.matched, String::new())
                }
            }
        };

        AttemptOutcome {
            state,
            exit_code,
            matched_rule,
            note,
            duration_s,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Write or clear the step's flag to match its final result
    fn persist_outcome(&mut self, sid: &str, result: &StepResult) {
        if !result.state.is_persisted() {
            self.store.remove(sid);
            self.flags.remove(sid);
            self.update_manifest(sid, None);
            return;
        }

        let mut extra = self
            .store
            .read(sid)
            .map(|flag| flag.extra)
            .unwrap_or_else(Map::new);
        if let Some(code) = result.exit_code {
            extra.insert("exit_code".to_string(), Value::from(code));
        }
        if !result.matched_rule.is_empty() {
            extra.insert(
                "matched_rule".to_string(),
                Value::String(result.matched_rule.clone()),
            );
        }

        match self
            .store
            .write(sid, result.state, &result.note, result.attempt, extra)
        {
            Ok(flag) => {
                self.update_manifest(sid, Some(&flag));
                self.flags.insert(sid.to_string(), flag);
            }
            Err(e) => warn!(
                error = %e,
                "Failed to persist flag for {}, outcome kept in memory only",
                sid
            ),
        }
    }

    fn mark_remaining_skipped(&mut self, failed_order: i64) {
        let later: Vec<String> = self
            .config
            .steps
            .iter()
            .filter(|s| s.order > failed_order)
            .map(StepSpec::sid)
            .collect();

        for sid in later {
            let result = StepResult {
                state: StepState::Skipped,
                note: "skipped after failure".to_string(),
                ..Default::default()
            };
            self.events.step_finished(&sid, &result);
            self.results.insert(sid, result);
        }
    }

    fn update_manifest(&mut self, sid: &str, flag: Option<&StepFlag>) {
        if let Some(entry) = self.manifest.iter_mut().find(|e| e.id == sid) {
            entry.apply_flag(flag);
        }
    }

    /// Forward every `file_contains` target to the log sink
    fn log_file_contains(&self, criteria: &PassCriteria, workdir: &Path) {
        for rule in criteria.rules() {
            let PassRule::FileContains { path, .. } = rule else {
                continue;
            };
            let full = workdir.join(path);
            match fs::read(&full) {
                Ok(bytes) => self.events.log_line(format!(
                    "[FILE] {}\n{}\n",
                    full.display(),
                    String::from_utf8_lossy(&bytes)
                )),
                Err(e) => self
                    .events
                    .log_line(format!("[FILE] {} unreadable: {}\n", full.display(), e)),
            }
        }
    }

    fn report_missing_artifacts(&self, step: &StepSpec, ctx: &PlaceholderContext, workdir: &Path) {
        for artifact in &step.artifacts {
            let path = workdir.join(ctx.expand(artifact));
            if !path.exists() {
                info!("Declared artifact missing: {}", path.display());
                self.events.log_line(format!(
                    "[ARTIFACT][{}] Missing declared artifact: {}\n",
                    step.sid(),
                    path.display()
                ));
            }
        }
    }

    fn write_run_meta(&self) {
        let meta = RunMeta {
            sn: self.run_dir.sn(),
            run_id: self.run_dir.run_id(),
            timestamp: timestamp(),
            run_mode: self.config.run.run_mode.to_string(),
            debug: self.debug,
            global_status: self.status(),
            station: self.config.meta.pruned(),
            run_context: RunContext {
                config_path: self
                    .config
                    .config_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                project_root: self.config.project_root.display().to_string(),
                run_dir: self.run_dir.path().display().to_string(),
                debug: self.debug,
            },
            steps_manifest: &self.manifest,
        };
        self.run_dir.write_meta(&meta);
    }

    fn emit_report(&self) -> Option<PathBuf> {
        let rows: Vec<ReportRow> = self
            .config
            .steps
            .iter()
            .map(|step| {
                let sid = step.sid();
                let result = self.results.get(&sid).cloned().unwrap_or_default();
                ReportRow::new(&sid, &result)
            })
            .collect();

        match self.run_dir.write_report(&rows) {
            Ok(path) => {
                info!("Report written: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "Failed to write report");
                None
            }
        }
    }
}

fn round_secs(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100.0).round() / 100.0
}
