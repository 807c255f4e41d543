use crate::infrastructure::config::{ConfigBundle, PersistenceBackend, ensure_default_configs, load_configs};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub database_path: PathBuf,
    pub configs: ConfigBundle,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("timebox.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    init_logging(&logs_dir)?;
    ensure_default_configs(&config_dir)?;
    let configs = load_configs(&config_dir)?;
    if configs.app.persistence.backend == PersistenceBackend::Sqlite {
        initialize_database(&database_path)?;
    }
    info!(
        workspace = %workspace_root.display(),
        timezone = %configs.app.timezone,
        "workspace ready"
    );

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        database_path,
        configs,
    })
}
