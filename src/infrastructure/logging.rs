use crate::infrastructure::error::InfraError;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const COMMAND_LOG: &str = "commands.log";

/// Routes `tracing` events as JSON lines into `<logs_dir>/commands.log`.
///
/// Returns `false` when a global subscriber was already installed, which is
/// the normal case for a second workspace in the same process.
pub fn init_logging(logs_dir: &Path) -> Result<bool, InfraError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(COMMAND_LOG))?;

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_current_span(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .is_ok();
    Ok(installed)
}
