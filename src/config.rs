//! Configuration for conduit paths and engine settings.
//!
//! `CONDUIT_HOME` and `CONDUIT_PIPELINES` override everything. Below them
//! sits the nearest `.conduit/config.yaml` found walking up from the working
//! directory, and below that the defaults (`~/.conduit`, `./pipelines`).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::event_store::DEFAULT_MAX_EVENT_BYTES;
use crate::core::EngineSettings;

static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// `.conduit/config.yaml`
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .conduit/)
    pub home: Option<String>,
    /// Pipeline definitions directory (relative to the project root)
    pub pipelines: Option<String>,
    /// Resource file for the resolver (relative to the project root)
    pub resources: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    pub max_event_bytes: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub wait_attempts: Option<u32>,
    pub default_step_timeout_seconds: Option<u64>,
    pub max_plan_passes: Option<usize>,
}

impl EngineConfig {
    fn settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            max_event_bytes: self.max_event_bytes.unwrap_or(DEFAULT_MAX_EVENT_BYTES),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            wait_attempts: self.wait_attempts.unwrap_or(defaults.wait_attempts),
            default_step_timeout: self
                .default_step_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_step_timeout),
            max_plan_passes: self.max_plan_passes.unwrap_or(defaults.max_plan_passes),
        }
    }
}

/// Effective configuration after env, file and defaults are layered
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state (event logs, index)
    pub home: PathBuf,
    /// Directory of pipeline YAML files
    pub pipelines: PathBuf,
    /// Optional YAML tree of credentials/connections/notifiers
    pub resources: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub engine: EngineSettings,
}

impl ResolvedConfig {
    /// Directory of per-execution event logs
    pub fn executions_dir(&self) -> PathBuf {
        self.home.join("executions")
    }

    /// SQLite execution index
    pub fn index_path(&self) -> PathBuf {
        self.home.join("index.db")
    }
}

/// Nearest `.conduit/config.yaml` in the working directory or its ancestors
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    cwd.ancestors()
        .map(|dir| dir.join(".conduit").join("config.yaml"))
        .find(|candidate| candidate.is_file())
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Absolute paths pass through; relative ones are joined onto `base`
fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let joined = base.join(path);
    joined.canonicalize().unwrap_or(joined)
}

/// An env var naming a path, when set and non-empty
fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".conduit");

    let config_file = find_config_file();
    let file = config_file
        .as_deref()
        .map(|path| load_config_file(path).map(|parsed| (path, parsed)))
        .transpose()?;

    // `home` is relative to .conduit/, everything else to the project root
    let mut home = default_home;
    let mut pipelines = PathBuf::from("pipelines");
    let mut resources = None;
    let mut engine = EngineSettings::default();

    if let Some((path, parsed)) = &file {
        let conduit_dir = path.parent().unwrap_or(Path::new("."));
        let project_dir = conduit_dir.parent().unwrap_or(Path::new("."));

        if let Some(raw) = &parsed.paths.home {
            home = resolve_path(conduit_dir, raw);
        }
        pipelines = match &parsed.paths.pipelines {
            Some(raw) => resolve_path(project_dir, raw),
            None => project_dir.join("pipelines"),
        };
        resources = parsed
            .paths
            .resources
            .as_deref()
            .map(|raw| resolve_path(project_dir, raw));
        if let Some(engine_config) = &parsed.engine {
            engine = engine_config.settings();
        }
    }

    Ok(ResolvedConfig {
        home: env_path("CONDUIT_HOME").unwrap_or(home),
        pipelines: env_path("CONDUIT_PIPELINES").unwrap_or(pipelines),
        resources,
        config_file,
        engine,
    })
}

/// Resolved configuration, loaded on first use
pub fn config() -> Result<&'static ResolvedConfig> {
    match CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e))) {
        Ok(config) => Ok(config),
        Err(message) => Err(anyhow::anyhow!(message.clone())),
    }
}

/// Load configuration again, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let conduit_dir = temp.path().join(".conduit");
        std::fs::create_dir_all(&conduit_dir).unwrap();

        let config_path = conduit_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
  pipelines: ./pipelines
engine:
  poll_interval_ms: 25
  wait_attempts: 40
  max_plan_passes: 50
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(config.paths.pipelines, Some("./pipelines".to_string()));
        assert!(config.paths.resources.is_none());

        let settings = config.engine.unwrap().settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(25));
        assert_eq!(settings.wait_attempts, 40);
        assert_eq!(settings.max_event_bytes, DEFAULT_MAX_EVENT_BYTES);
        assert_eq!(settings.default_step_timeout, Duration::from_secs(300));
        assert_eq!(settings.max_plan_passes, 50);
    }

    #[test]
    fn test_engine_defaults() {
        let settings = EngineConfig::default().settings();
        assert_eq!(settings.max_event_bytes, 1024 * 1024);
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.wait_attempts, 600);
        assert_eq!(settings.max_plan_passes, 1000);
    }

    #[test]
    fn test_state_paths() {
        let config = ResolvedConfig {
            home: PathBuf::from("/test/.conduit"),
            pipelines: PathBuf::from("/test/pipelines"),
            resources: None,
            config_file: None,
            engine: EngineSettings::default(),
        };

        assert_eq!(
            config.executions_dir(),
            PathBuf::from("/test/.conduit/executions")
        );
        assert_eq!(config.index_path(), PathBuf::from("/test/.conduit/index.db"));
    }

    #[test]
    fn test_relative_paths_join_base() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("defs")).unwrap();
        let base = temp.path().canonicalize().unwrap();

        assert_eq!(resolve_path(&base, "./defs"), base.join("defs"));
        assert_eq!(resolve_path(&base, "missing"), base.join("missing"));
        assert_eq!(resolve_path(&base, "/srv/conduit"), PathBuf::from("/srv/conduit"));
    }
}
