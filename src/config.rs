//! Configuration for the actions server, read from `.forge/actions.toml`.
//!
//! Values are layered: CLI flag, then environment, then file, then defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//!
//! [database]
//! path = ".forge/actions.db"
//!
//! [actions]
//! skip_workflow_strings = ["[skip ci]", "[ci skip]", "[no ci]", "[skip actions]", "[actions skip]"]
//! limit_dispatch_inputs = 10
//! default_runs_on = []
//! cancel_superseded_runs = true
//! zombie_task_timeout_secs = 600
//! endless_task_timeout_secs = 10800
//! abandoned_job_timeout_secs = 86400
//! offline_runner_cleanup_secs = 0
//! sweep_interval_secs = 300
//!
//! [log]
//! level = "info"
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".forge/actions.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".forge/actions.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Engine settings handed to the actions service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionsSection {
    /// Markers that suppress runs when found in a commit message or PR title.
    #[serde(default = "default_skip_workflow_strings")]
    pub skip_workflow_strings: Vec<String>,
    /// Maximum number of `workflow_dispatch` inputs a workflow may declare.
    #[serde(default = "default_limit_dispatch_inputs")]
    pub limit_dispatch_inputs: usize,
    /// Labels required by jobs that declare no `runs-on`.
    #[serde(default)]
    pub default_runs_on: Vec<String>,
    /// Cancel unfinished runs of the same workflow and ref when a push
    /// creates a newer one.
    #[serde(default = "default_true")]
    pub cancel_superseded_runs: bool,
    /// Running tasks with no runner update for this long are failed.
    #[serde(default = "default_zombie_task_timeout")]
    pub zombie_task_timeout_secs: u64,
    /// Running tasks started longer ago than this are failed.
    #[serde(default = "default_endless_task_timeout")]
    pub endless_task_timeout_secs: u64,
    /// Waiting or blocked jobs untouched for this long are cancelled.
    #[serde(default = "default_abandoned_job_timeout")]
    pub abandoned_job_timeout_secs: u64,
    /// Runners offline for this long are removed; 0 keeps them forever.
    #[serde(default)]
    pub offline_runner_cleanup_secs: u64,
    /// Period of the server's background sweep; 0 disables it.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_skip_workflow_strings() -> Vec<String> {
    ["[skip ci]", "[ci skip]", "[no ci]", "[skip actions]", "[actions skip]"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_limit_dispatch_inputs() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_zombie_task_timeout() -> u64 {
    10 * 60
}

fn default_endless_task_timeout() -> u64 {
    3 * 60 * 60
}

fn default_abandoned_job_timeout() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

impl Default for ActionsSection {
    fn default() -> Self {
        Self {
            skip_workflow_strings: default_skip_workflow_strings(),
            limit_dispatch_inputs: default_limit_dispatch_inputs(),
            default_runs_on: Vec::new(),
            cancel_superseded_runs: true,
            zombie_task_timeout_secs: default_zombie_task_timeout(),
            endless_task_timeout_secs: default_endless_task_timeout(),
            abandoned_job_timeout_secs: default_abandoned_job_timeout(),
            offline_runner_cleanup_secs: 0,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// The complete actions.toml structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionsToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub actions: ActionsSection,
    #[serde(default)]
    pub log: LogSection,
}

impl ActionsToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse actions.toml")
    }

    /// Load the file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize actions.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("FORGE_ACTIONS_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("FORGE_ACTIONS_DB").filter(|v| !v.is_empty()) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(json) = lookup("FORGE_ACTIONS_LOG_JSON") {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the server will bind a random port".to_string());
        }
        if self
            .actions
            .skip_workflow_strings
            .iter()
            .any(|s| s.trim().is_empty())
        {
            warnings.push(
                "actions.skip_workflow_strings contains an empty marker, every event would be skipped"
                    .to_string(),
            );
        }
        if self.actions.limit_dispatch_inputs == 0 {
            warnings.push(
                "actions.limit_dispatch_inputs is 0: workflows with dispatch inputs cannot be run"
                    .to_string(),
            );
        }
        if self.actions.zombie_task_timeout_secs == 0 || self.actions.endless_task_timeout_secs == 0 {
            warnings.push(
                "actions task timeouts of 0 fail every running task on the next sweep".to_string(),
            );
        }
        if self.log.level.parse::<tracing::Level>().is_err() {
            warnings.push(format!("Unknown log.level '{}'", self.log.level));
        }

        warnings
    }
}

/// Resolved configuration: file and environment merged with CLI flags.
#[derive(Debug, Clone)]
pub struct ActionsConfig {
    pub config_path: PathBuf,
    pub toml: ActionsToml,
    pub cli_port: Option<u16>,
    pub cli_db_path: Option<PathBuf>,
    pub cli_json_logs: bool,
}

impl ActionsConfig {
    /// Load the file at `config_path` (or defaults) and apply process env.
    pub fn load(config_path: PathBuf) -> Result<Self> {
        let mut toml = ActionsToml::load_or_default(&config_path)?;
        toml.apply_env(|key| std::env::var(key).ok());
        Ok(Self {
            config_path,
            toml,
            cli_port: None,
            cli_db_path: None,
            cli_json_logs: false,
        })
    }

    /// Layer CLI flags on top of file and environment.
    pub fn with_cli_args(
        mut self,
        port: Option<u16>,
        db_path: Option<PathBuf>,
        json_logs: bool,
    ) -> Self {
        self.cli_port = port;
        self.cli_db_path = db_path;
        self.cli_json_logs = json_logs;
        self
    }

    pub fn host(&self) -> &str {
        &self.toml.server.host
    }

    pub fn port(&self) -> u16 {
        self.cli_port.unwrap_or(self.toml.server.port)
    }

    pub fn db_path(&self) -> PathBuf {
        self.cli_db_path
            .clone()
            .unwrap_or_else(|| self.toml.database.path.clone())
    }

    pub fn json_logs(&self) -> bool {
        self.cli_json_logs || self.toml.log.json
    }

    pub fn log_level(&self) -> &str {
        &self.toml.log.level
    }

    pub fn settings(&self) -> ActionsSection {
        self.toml.actions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let toml = ActionsToml::default();
        assert_eq!(toml.server.port, 3142);
        assert_eq!(toml.database.path, PathBuf::from(".forge/actions.db"));
        assert_eq!(toml.actions.limit_dispatch_inputs, 10);
        assert!(
            toml.actions
                .skip_workflow_strings
                .contains(&"[skip ci]".to_string())
        );
        assert_eq!(toml.actions.skip_workflow_strings.len(), 5);
        assert!(toml.actions.cancel_superseded_runs);
        assert_eq!(toml.actions.zombie_task_timeout_secs, 600);
        assert_eq!(toml.actions.endless_task_timeout_secs, 10800);
        assert_eq!(toml.actions.abandoned_job_timeout_secs, 86400);
        assert_eq!(toml.actions.offline_runner_cleanup_secs, 0);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() -> Result<()> {
        let toml = ActionsToml::parse(
            r#"
            [server]
            port = 8080

            [actions]
            skip_workflow_strings = ["[nope]"]
            "#,
        )?;
        assert_eq!(toml.server.port, 8080);
        assert_eq!(toml.server.host, "127.0.0.1");
        assert_eq!(toml.actions.skip_workflow_strings, vec!["[nope]".to_string()]);
        assert_eq!(toml.actions.limit_dispatch_inputs, 10);
        assert_eq!(toml.log.level, "info");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ActionsToml::parse("[server\nport = ").is_err());
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".forge").join("actions.toml");
        let mut toml = ActionsToml::default();
        toml.actions.default_runs_on = vec!["docker".to_string()];
        toml.save(&path)?;

        let loaded = ActionsToml::load(&path)?;
        assert_eq!(loaded, toml);
        Ok(())
    }

    #[test]
    fn test_load_or_default_missing_file() -> Result<()> {
        let dir = TempDir::new()?;
        let toml = ActionsToml::load_or_default(&dir.path().join("missing.toml"))?;
        assert_eq!(toml, ActionsToml::default());
        Ok(())
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FORGE_ACTIONS_PORT", "9000"),
            ("FORGE_ACTIONS_DB", "/tmp/a.db"),
            ("FORGE_ACTIONS_LOG_JSON", "true"),
        ]);
        let mut toml = ActionsToml::default();
        toml.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(toml.server.port, 9000);
        assert_eq!(toml.database.path, PathBuf::from("/tmp/a.db"));
        assert!(toml.log.json);
    }

    #[test]
    fn test_env_ignores_unparseable_port() {
        let mut toml = ActionsToml::default();
        toml.apply_env(|key| (key == "FORGE_ACTIONS_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(toml.server.port, 3142);
    }

    #[test]
    fn test_cli_overrides_env_and_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("actions.toml");
        std::fs::write(&path, "[server]\nport = 4000\n")?;

        let config = ActionsConfig::load(path)?.with_cli_args(
            Some(5000),
            Some(PathBuf::from("cli.db")),
            true,
        );
        assert_eq!(config.port(), 5000);
        assert_eq!(config.db_path(), PathBuf::from("cli.db"));
        assert!(config.json_logs());
        Ok(())
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = ActionsToml::default();
        toml.server.port = 0;
        toml.actions.skip_workflow_strings.push("  ".to_string());
        toml.actions.limit_dispatch_inputs = 0;
        toml.log.level = "loud".to_string();
        toml.actions.zombie_task_timeout_secs = 0;

        let warnings = toml.validate();
        assert_eq!(warnings.len(), 5);
        assert!(warnings.iter().any(|w| w.contains("task timeouts")));
        assert!(warnings.iter().any(|w| w.contains("server.port")));
        assert!(warnings.iter().any(|w| w.contains("empty marker")));
        assert!(warnings.iter().any(|w| w.contains("limit_dispatch_inputs")));
        assert!(warnings.iter().any(|w| w.contains("loud")));
    }
}
