//! Config file discovery: one global file plus the nearest project file.

use super::{ConfigOverrides, ConfigStore};
use crate::error::RunError;
use std::path::{Path, PathBuf};

/// Project file names, checked in order in each directory while walking upward.
pub const PROJECT_FILE_NAMES: [&str; 2] = [".build-runner.json", "build-runner.json"];

const APP_DIR: &str = "build-runner";
const GLOBAL_FILE_NAME: &str = "config.json";

/// What a load pass read and what it had to skip.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub sources: Vec<PathBuf>,
    pub failures: Vec<RunError>,
}

pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(GLOBAL_FILE_NAME))
}

/// Search `start` and its ancestors for a recognized project file.
pub fn find_project_file(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        PROJECT_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Parse one config file into an override layer.
pub fn read_layer(path: &Path) -> Result<ConfigOverrides, RunError> {
    let failure = |reason: String| RunError::ConfigLoadFailure {
        path: path.to_path_buf(),
        field: None,
        reason,
    };
    let body = std::fs::read_to_string(path).map_err(|e| failure(e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_str(&body).map_err(|e| failure(format!("invalid JSON: {e}")))?;
    match value {
        serde_json::Value::Object(map) => Ok(ConfigOverrides::from_json_object(map)),
        _ => Err(failure("expected a JSON object at the top level".into())),
    }
}

/// Merge one file into the store. Failures are returned, never fatal.
pub fn load_file(store: &mut ConfigStore, path: &Path, report: &mut LoadReport) {
    match read_layer(path) {
        Ok(layer) => {
            tracing::debug!(path = %path.display(), "loaded config layer");
            report.sources.push(path.to_path_buf());
            for issue in store.merge(&layer) {
                report.failures.push(RunError::ConfigLoadFailure {
                    path: path.to_path_buf(),
                    field: Some(issue.field),
                    reason: issue.reason,
                });
            }
        }
        Err(e) => {
            tracing::warn!("{e}");
            report.failures.push(e);
        }
    }
}

/// Layer the global file and then the nearest project file above `cwd` onto `store`.
pub fn load(store: &mut ConfigStore, global: Option<&Path>, cwd: &Path) -> LoadReport {
    let mut report = LoadReport::default();
    if let Some(global) = global.filter(|p| p.is_file()) {
        load_file(store, global, &mut report);
    }
    if let Some(project) = find_project_file(cwd) {
        load_file(store, &project, &mut report);
    }
    report
}
