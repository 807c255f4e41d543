use crate::domain::calendar::LocalCalendar;
use crate::domain::drag::{SnapSettings, TimelineGeometry};
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const SCHEDULING_JSON: &str = "scheduling.json";
const SUPPORTED_SCHEMA: u64 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    Sqlite,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    pub base_url: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub schema: u8,
    pub app_name: String,
    pub timezone: String,
    pub persistence: PersistenceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            app_name: "Timebox".to_string(),
            timezone: "UTC".to_string(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn calendar(&self) -> Result<LocalCalendar, InfraError> {
        Ok(LocalCalendar::parse(&self.timezone)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewsConfig {
    pub kanban_range_days: u32,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            kanban_range_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingConfig {
    pub schema: u8,
    pub duplicate_offset_minutes: i64,
    pub snap_minutes: i64,
    pub precision_snap_minutes: i64,
    pub min_duration_minutes: i64,
    pub edge_hit_pixels: f64,
    pub visible_start_hour: u32,
    pub visible_end_hour: u32,
    pub retry: RetryConfig,
    pub views: ViewsConfig,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        let snap = SnapSettings::default();
        Self {
            schema: 1,
            duplicate_offset_minutes: 60,
            snap_minutes: snap.snap_minutes,
            precision_snap_minutes: snap.precision_snap_minutes,
            min_duration_minutes: snap.min_duration_minutes,
            edge_hit_pixels: snap.edge_hit_pixels,
            visible_start_hour: 0,
            visible_end_hour: 24,
            retry: RetryConfig::default(),
            views: ViewsConfig::default(),
        }
    }
}

impl SchedulingConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        if self.snap_minutes < 1 || self.precision_snap_minutes < 1 {
            return Err(InfraError::InvalidConfig(
                "snapMinutes and precisionSnapMinutes must be >= 1".to_string(),
            ));
        }
        if self.min_duration_minutes < 1 {
            return Err(InfraError::InvalidConfig(
                "minDurationMinutes must be >= 1".to_string(),
            ));
        }
        if self.duplicate_offset_minutes == 0 {
            return Err(InfraError::InvalidConfig(
                "duplicateOffsetMinutes must not be 0".to_string(),
            ));
        }
        if self.visible_start_hour >= self.visible_end_hour || self.visible_end_hour > 24 {
            return Err(InfraError::InvalidConfig(format!(
                "visible hours {}..{} are out of range",
                self.visible_start_hour, self.visible_end_hour
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(InfraError::InvalidConfig(
                "retry.maxAttempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn snap_settings(&self) -> SnapSettings {
        SnapSettings {
            snap_minutes: self.snap_minutes,
            precision_snap_minutes: self.precision_snap_minutes,
            min_duration_minutes: self.min_duration_minutes,
            edge_hit_pixels: self.edge_hit_pixels,
        }
    }

    pub fn geometry(&self, width_px: f64) -> TimelineGeometry {
        TimelineGeometry {
            width_px,
            visible_start_hour: self.visible_start_hour,
            visible_end_hour: self.visible_end_hour,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub app: AppConfig,
    pub scheduling: SchedulingConfig,
}

fn default_files() -> Result<HashMap<&'static str, serde_json::Value>, InfraError> {
    Ok(HashMap::from([
        (APP_JSON, serde_json::to_value(AppConfig::default())?),
        (
            SCHEDULING_JSON,
            serde_json::to_value(SchedulingConfig::default())?,
        ),
    ]))
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files()? {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    let path = config_dir.join(APP_JSON);
    let app: AppConfig = serde_json::from_value(read_config(&path)?)?;
    app.calendar()?;
    if app.persistence.backend == PersistenceBackend::Http
        && app
            .persistence
            .base_url
            .as_deref()
            .map(str::trim)
            .is_none_or(str::is_empty)
    {
        return Err(InfraError::InvalidConfig(format!(
            "persistence.baseUrl is required for the http backend in {}",
            path.display()
        )));
    }
    Ok(app)
}

pub fn load_scheduling_config(config_dir: &Path) -> Result<SchedulingConfig, InfraError> {
    let scheduling: SchedulingConfig =
        serde_json::from_value(read_config(&config_dir.join(SCHEDULING_JSON))?)?;
    scheduling.validate()?;
    Ok(scheduling)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: load_app_config(config_dir)?,
        scheduling: load_scheduling_config(config_dir)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new() -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock before epoch")
                .as_nanos();
            let path = std::env::temp_dir().join(format!("timebox-config-test-{nanos}"));
            fs::create_dir_all(&path).expect("create temp config dir");
            Self { path }
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn defaults_are_written_once_and_loaded() {
        let dir = TempConfigDir::new();
        ensure_default_configs(&dir.path).expect("write defaults");

        let bundle = load_configs(&dir.path).expect("load defaults");
        assert_eq!(bundle.app.timezone, "UTC");
        assert_eq!(bundle.scheduling.duplicate_offset_minutes, 60);
        assert_eq!(bundle.scheduling.snap_settings(), SnapSettings::default());

        fs::write(
            dir.path.join(APP_JSON),
            r#"{"schema":1,"timezone":"Asia/Tokyo"}"#,
        )
        .expect("overwrite app config");
        ensure_default_configs(&dir.path).expect("keep existing");
        let app = load_app_config(&dir.path).expect("load edited");
        assert_eq!(app.timezone, "Asia/Tokyo");
        assert_eq!(app.persistence.backend, PersistenceBackend::Sqlite);
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = TempConfigDir::new();
        fs::write(dir.path.join(SCHEDULING_JSON), r#"{"schema":2}"#).expect("write config");
        let error = load_scheduling_config(&dir.path).expect_err("schema 2");
        assert!(error.to_string().contains("unsupported schema 2"));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let dir = TempConfigDir::new();
        fs::write(
            dir.path.join(APP_JSON),
            r#"{"schema":1,"timezone":"Nowhere/Special"}"#,
        )
        .expect("write config");
        assert!(matches!(
            load_app_config(&dir.path),
            Err(InfraError::Domain(_))
        ));
    }

    #[test]
    fn http_backend_requires_base_url() {
        let dir = TempConfigDir::new();
        fs::write(
            dir.path.join(APP_JSON),
            r#"{"schema":1,"persistence":{"backend":"http"}}"#,
        )
        .expect("write config");
        assert!(matches!(
            load_app_config(&dir.path),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn visible_hours_must_be_ordered() {
        let config = SchedulingConfig {
            visible_start_hour: 22,
            visible_end_hour: 6,
            ..SchedulingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
