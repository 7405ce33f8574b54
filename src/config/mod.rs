//! Application configuration file
//!
//! A TOML file with one table per subsystem:
//!
//! ```toml
//! [worker]
//! program = ""            # empty: this executable in `serve` mode
//! default_timeout = "30s"
//! tool_timeouts = { predict_protein_function_tool = "60s" }
//!
//! [llm]
//! provider = "deepseek"
//!
//! [lookup]
//! request_timeout = "20s"
//! ```
//!
//! Every key is optional. Environment variables prefixed `TOOLBRIDGE_`
//! override the file.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::llm::LlmConfig;
use crate::lookup::LookupConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration at '{path}': {message}")]
    Invalid { path: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub lookup: LookupConfig,
}

/// `<config_dir>/toolbridge/config.toml` for the current user.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "toolbridge").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl AppConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    /// Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn merge_env_vars(&mut self) {
        self.merge_from(|key| std::env::var(key).ok());
    }

    /// Apply `TOOLBRIDGE_*` overrides read through `var`.
    pub fn merge_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(program) = var("TOOLBRIDGE_WORKER_PROGRAM") {
            self.worker.program = program;
        }

        if let Some(provider) = var("TOOLBRIDGE_LLM_PROVIDER") {
            match provider.parse() {
                Ok(provider) => self.llm.provider = provider,
                Err(e) => tracing::warn!("Ignoring TOOLBRIDGE_LLM_PROVIDER: {}", e),
            }
        }

        if let Some(model) = var("TOOLBRIDGE_LLM_MODEL") {
            self.llm.model = Some(model);
        }

        if let Some(base_url) = var("TOOLBRIDGE_LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }

        if let Some(base_url) = var("TOOLBRIDGE_LOOKUP_BASE_URL") {
            self.lookup.base_url = base_url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |path: &str, message: &str| ConfigError::Invalid {
            path: path.to_string(),
            message: message.to_string(),
        };

        if self.worker.response_queue_capacity == 0 {
            return Err(invalid(
                "worker.response_queue_capacity",
                "must be at least 1",
            ));
        }
        if self.worker.diagnostic_capacity == 0 {
            return Err(invalid("worker.diagnostic_capacity", "must be at least 1"));
        }
        if self.worker.default_timeout.is_zero() {
            return Err(invalid("worker.default_timeout", "must be greater than zero"));
        }
        if let Some((tool, _)) = self
            .worker
            .tool_timeouts
            .iter()
            .find(|(_, timeout)| timeout.is_zero())
        {
            return Err(invalid(
                &format!("worker.tool_timeouts.{tool}"),
                "must be greater than zero",
            ));
        }
        if self.lookup.base_url.trim().is_empty() {
            return Err(invalid("lookup.base_url", "must not be empty"));
        }
        if self.llm.json_retries > 10 {
            return Err(invalid("llm.json_retries", "must be 10 or less"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.worker.default_timeout, Duration::from_secs(30));
        assert_eq!(config.worker.response_queue_capacity, 100);
        assert_eq!(config.lookup.base_url, "https://rest.uniprot.org");
        assert_eq!(config.llm.provider, Provider::Openai);
    }

    #[test]
    fn test_parses_all_sections() {
        let config = AppConfig::from_toml(
            r#"
            [worker]
            program = "/usr/local/bin/tools"
            args = ["serve", "--debug-tools"]
            startup_probe = "250ms"
            tool_timeouts = { predict_protein_function_tool = "60s" }
            diagnostic_capacity = 50

            [llm]
            provider = "deepseek"
            request_timeout = "2m"

            [lookup]
            request_timeout = "5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.program, "/usr/local/bin/tools");
        assert_eq!(config.worker.startup_probe, Duration::from_millis(250));
        assert_eq!(
            config.worker.timeout_for("predict_protein_function_tool"),
            Duration::from_secs(60)
        );
        assert_eq!(config.worker.timeout_for("echo"), Duration::from_secs(30));
        assert_eq!(config.worker.diagnostic_capacity, 50);
        assert_eq!(config.llm.provider, Provider::Deepseek);
        assert_eq!(config.llm.request_timeout, Duration::from_secs(120));
        assert_eq!(config.lookup.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_reports_missing_and_broken_files() {
        let missing = AppConfig::load(Some(Path::new("/nonexistent/toolbridge.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[worker\nprogram = 1").unwrap();
        let broken = AppConfig::load(Some(file.path()));
        assert!(matches!(broken, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nresponse_queue_capacity = 0").unwrap();
        match AppConfig::load(Some(file.path())) {
            Err(ConfigError::Invalid { path, .. }) => {
                assert_eq!(path, "worker.response_queue_capacity")
            }
            other => panic!("Expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TOOLBRIDGE_WORKER_PROGRAM", "/opt/worker"),
            ("TOOLBRIDGE_LLM_PROVIDER", "volcengine"),
            ("TOOLBRIDGE_LLM_MODEL", "ep-123"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.merge_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.worker.program, "/opt/worker");
        assert_eq!(config.llm.provider, Provider::Ark);
        assert_eq!(config.llm.model.as_deref(), Some("ep-123"));
    }

    #[test]
    fn test_unknown_provider_is_ignored() {
        let mut config = AppConfig::default();
        config.merge_from(|key| (key == "TOOLBRIDGE_LLM_PROVIDER").then(|| "nope".to_string()));
        assert_eq!(config.llm.provider, Provider::Openai);
    }
}
