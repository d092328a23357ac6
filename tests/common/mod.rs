#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use station_flow::{StationConfig, StepSpec};
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Write `config/station.yaml` under `root` and return its path
pub fn write_station(root: &Path, content: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).expect("Failed to create config directory");
    let path = config_dir.join("station.yaml");
    fs::write(&path, content).expect("Failed to write station file");
    path
}

pub fn station(root: &Path, steps: Vec<StepSpec>) -> StationConfig {
    StationConfig::new(root, steps)
}

pub fn step(order: i64, name: &str, cmd: &str) -> StepSpec {
    StepSpec::new(order, name, cmd)
}

pub fn read_json(path: &Path) -> Value {
    let text = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    serde_json::from_str(&text).expect("Invalid JSON")
}

pub fn pointer(root: &Path, sn: &str) -> Value {
    read_json(&root.join("runs").join(sn).join("latest_run.json"))
}

/// A shell snippet that fails until it has been run `n` times in its workdir
pub fn succeed_on_attempt(n: u32) -> String {
    format!(
        "c=$(cat count 2>/dev/null || echo 0); c=$((c+1)); echo $c > count; [ $c -ge {} ]",
        n
    )
}

/// Running and not a zombie, per `ps`
pub fn process_alive(pid: &str) -> bool {
    std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", pid])
        .output()
        .map(|out| {
            let stat = String::from_utf8_lossy(&out.stdout);
            let stat = stat.trim();
            !stat.is_empty() && !stat.starts_with('Z')
        })
        .unwrap_or(false)
}

pub const SIMPLE_STATION: &str = r#"
meta:
  station_id: ST01
  line_id: L3
run:
  run_mode: stop_on_fail
  default_timeout_sec: 30
steps:
  - order: 10
    name: Power
    cmd: "echo POWER_OK"
    pass_by: "stdout_contains:POWER_OK"
  - order: 20
    name: Flash
    cmd: "echo flashed {SN}"
"#;

pub const FAILING_STATION: &str = r#"
run:
  report_emit_on: "stopped_on_fail"
steps:
  - order: 10
    name: Power
    cmd: "exit 1"
  - order: 20
    name: Flash
    cmd: "true"
"#;
