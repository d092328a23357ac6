//! Station file loader
//!
//! Reads a station YAML file, resolves the project root, and rejects step
//! lists the engine cannot run (duplicate ids, unnamed steps).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::config::StationConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Invalid step at order {order}: {reason}")]
    InvalidStep { order: i64, reason: String },
}

pub struct StationLoader;

impl StationLoader {
    pub fn load_file(path: &Path) -> Result<StationConfig, LoadError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content).map_err(|e| match e {
            LoadError::Yaml { error, .. } => LoadError::Yaml {
                file: path.display().to_string(),
                error,
            },
            other => other,
        })?;

        let config_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.project_root = project_root_for(&config_dir);
        config.config_dir = config_dir;
        config.config_path = Some(config_path);
        Ok(config)
    }

    /// Parse station YAML without touching the filesystem.
    ///
    /// The project root defaults to the current directory.
    pub fn parse(content: &str) -> Result<StationConfig, LoadError> {
        let content = content.trim_start_matches('\u{feff}');
        let mut config: StationConfig =
            serde_yaml::from_str(content).map_err(|e| LoadError::Yaml {
                file: "<inline>".to_string(),
                error: e,
            })?;

        validate_steps(&config)?;
        config.steps.sort_by_key(|s| s.order);
        config.project_root = PathBuf::from(".");
        config.config_dir = PathBuf::from(".");
        Ok(config)
    }
}

/// A config directory named `config` lives inside the project root
fn project_root_for(config_dir: &Path) -> PathBuf {
    let is_config_dir = config_dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.eq_ignore_ascii_case("config"))
        .unwrap_or(false);
    match config_dir.parent() {
        Some(parent) if is_config_dir => parent.to_path_buf(),
        _ => config_dir.to_path_buf(),
    }
}

fn validate_steps(config: &StationConfig) -> Result<(), LoadError> {
    let mut seen = HashSet::new();
    for step in &config.steps {
        if step.name.trim().is_empty() {
            return Err(LoadError::InvalidStep {
                order: step.order,
                reason: "step name is empty".to_string(),
            });
        }
        if !seen.insert(step.sid()) {
            return Err(LoadError::DuplicateStep(step.sid()));
        }
    }
    Ok(())
}
