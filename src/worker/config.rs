//! Worker launch and transport configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::WorkerError;

/// Everything needed to launch and talk to one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable. Empty means "this executable, `serve` mode".
    #[serde(default)]
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long a freshly spawned worker must survive before it counts as started
    #[serde(with = "humantime_serde", default = "default_startup_probe")]
    pub startup_probe: Duration,

    /// Time between the graceful termination request and the forced kill
    #[serde(with = "humantime_serde", default = "default_stop_grace")]
    pub stop_grace: Duration,

    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub default_timeout: Duration,

    /// Per-tool overrides of `default_timeout`
    #[serde(with = "duration_map", default)]
    pub tool_timeouts: HashMap<String, Duration>,

    #[serde(default = "default_response_queue_capacity")]
    pub response_queue_capacity: usize,

    #[serde(default = "default_diagnostic_capacity")]
    pub diagnostic_capacity: usize,
}

mod duration_map {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(tool, timeout)| (tool.clone(), Serde::from(*timeout)))
            .collect::<HashMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let raw = HashMap::<String, Serde<Duration>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(tool, timeout)| (tool, timeout.into_inner()))
            .collect())
    }
}

fn default_startup_probe() -> Duration {
    Duration::from_millis(500)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_response_queue_capacity() -> usize {
    100
}

fn default_diagnostic_capacity() -> usize {
    200
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            startup_probe: default_startup_probe(),
            stop_grace: default_stop_grace(),
            default_timeout: default_timeout(),
            tool_timeouts: HashMap::new(),
            response_queue_capacity: default_response_queue_capacity(),
            diagnostic_capacity: default_diagnostic_capacity(),
        }
    }
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn startup_probe(mut self, probe: Duration) -> Self {
        self.startup_probe = probe;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn tool_timeout(mut self, tool: &str, timeout: Duration) -> Self {
        self.tool_timeouts.insert(tool.to_string(), timeout);
        self
    }

    pub fn queue_capacities(mut self, responses: usize, diagnostics: usize) -> Self {
        self.response_queue_capacity = responses;
        self.diagnostic_capacity = diagnostics;
        self
    }

    /// Deadline applied to `tool` when the caller does not pass one.
    pub fn timeout_for(&self, tool: &str) -> Duration {
        self.tool_timeouts
            .get(tool)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Fill in the current executable in `serve` mode when no program is set.
    pub fn resolve_program(mut self) -> Result<Self, WorkerError> {
        if self.program.trim().is_empty() {
            let exe = std::env::current_exe().map_err(|e| {
                WorkerError::InvalidConfig(format!("cannot locate current executable: {e}"))
            })?;
            self.program = exe.to_string_lossy().into_owned();
            self.args = vec!["serve".to_string()];
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.program.trim().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "worker program must not be empty".to_string(),
            ));
        }
        if self.response_queue_capacity == 0 {
            return Err(WorkerError::InvalidConfig(
                "response_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.diagnostic_capacity == 0 {
            return Err(WorkerError::InvalidConfig(
                "diagnostic_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Command line as a single string, for log messages.
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_settings() {
        let config = WorkerConfig::new("python3")
            .arg("server.py")
            .args(["--quiet"])
            .env("MODE", "test")
            .current_dir(Path::new("/tmp"))
            .tool_timeout("search_proteins", Duration::from_secs(60))
            .queue_capacities(10, 20);

        assert_eq!(config.args, vec!["server.py", "--quiet"]);
        assert_eq!(config.env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.response_queue_capacity, 10);
        assert_eq!(config.diagnostic_capacity, 20);
        assert_eq!(config.display_command(), "python3 server.py --quiet");
    }

    #[test]
    fn test_timeout_for_prefers_tool_override() {
        let config = WorkerConfig::new("w")
            .default_timeout(Duration::from_secs(5))
            .tool_timeout("slow", Duration::from_secs(90));
        assert_eq!(config.timeout_for("slow"), Duration::from_secs(90));
        assert_eq!(config.timeout_for("other"), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = WorkerConfig::new("w").queue_capacities(0, 5);
        assert!(matches!(
            config.validate(),
            Err(WorkerError::InvalidConfig(_))
        ));
        assert!(WorkerConfig::default().validate().is_err());
    }

    #[test]
    fn test_resolve_program_uses_current_exe() {
        let config = WorkerConfig::default().resolve_program().unwrap();
        assert!(!config.program.is_empty());
        assert_eq!(config.args, vec!["serve"]);

        let explicit = WorkerConfig::new("worker").resolve_program().unwrap();
        assert_eq!(explicit.program, "worker");
        assert!(explicit.args.is_empty());
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let config: WorkerConfig = toml::from_str(
            r#"
            program = "python3"
            args = ["mcp_server.py"]
            startup_probe = "250ms"
            default_timeout = "45s"

            [tool_timeouts]
            predict_protein_function_tool = "2m"
            "#,
        )
        .unwrap();

        assert_eq!(config.startup_probe, Duration::from_millis(250));
        assert_eq!(config.default_timeout, Duration::from_secs(45));
        assert_eq!(config.stop_grace, Duration::from_secs(3));
        assert_eq!(
            config.timeout_for("predict_protein_function_tool"),
            Duration::from_secs(120)
        );
        assert_eq!(config.response_queue_capacity, 100);
        assert_eq!(config.diagnostic_capacity, 200);
    }
}
