use crate::infrastructure::config::{ensure_default_configs, load_configs};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

pub const DATABASE_FILE: &str = "huddle.sqlite";
pub const LOG_FILE: &str = "huddle.log";

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
}

impl BootstrapResult {
    pub fn log_path(&self) -> PathBuf {
        self.logs_dir.join(LOG_FILE)
    }
}

/// Lays out `config/`, `state/` and `logs/` under the workspace root, writes
/// any missing default config, and makes sure the decision log schema exists.
/// Safe to run on every launch.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let _ = load_configs(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let root = std::env::temp_dir().join(format!("huddle-bootstrap-tests-{}", std::process::id()));
        let first = bootstrap_workspace(&root).expect("first bootstrap");
        let second = bootstrap_workspace(&root).expect("second bootstrap");

        assert!(first.config_dir.join("app.json").exists());
        assert!(first.config_dir.join("policies.json").exists());
        assert!(first.config_dir.join("agenda.json").exists());
        assert!(first.database_path.exists());
        assert!(first.logs_dir.is_dir());
        assert_eq!(first.database_path, second.database_path);
        assert_eq!(first.log_path(), root.join("logs").join(LOG_FILE));

        let _ = fs::remove_dir_all(&root);
    }
}
