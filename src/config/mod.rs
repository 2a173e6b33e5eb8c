use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::supervisor::ServiceDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory tree all file operations are confined to.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Shell used to spawn commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Deadline applied to commands that do not carry their own timeout.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// How long a process gets between SIGTERM and SIGKILL.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Cap on captured bytes per output stream (default: 1MB).
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Container runtime program: "docker" or "podman".
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Fixed catalogue of supervised services.
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error" | "warn" | "info" | "debug" | "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_root() -> PathBuf {
    PathBuf::from("/sandbox")
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_kill_grace() -> u64 {
    5
}

fn default_max_output() -> usize {
    1024 * 1024
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            shell: default_shell(),
            default_timeout_secs: default_timeout(),
            kill_grace_secs: default_kill_grace(),
            max_output_bytes: default_max_output(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            services: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to `sandboxd.toml` in
    /// the working directory, or to built-in defaults when neither
    /// exists. The `SANDBOX_ROOT` environment variable overrides the
    /// configured sandbox root.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("sandboxd.toml"));

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        if let Ok(root) = std::env::var("SANDBOX_ROOT") {
            config.sandbox.root = PathBuf::from(root);
        }

        Ok(config)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::Backing;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.sandbox.root, PathBuf::from("/sandbox"));
        assert_eq!(config.sandbox.default_timeout_secs, 60);
        assert!(config.supervisor.services.is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.sandbox.shell, "/bin/bash");
    }

    #[test]
    fn service_catalogue_parses_tagged_backings() {
        let config: Config = toml::from_str(
            r#"
            [[supervisor.services]]
            name = "redis"
            backing = { container = { id = "sandbox-redis" } }

            [[supervisor.services]]
            name = "worker"
            backing = { process = { command = "python worker.py" } }
            "#,
        )
        .unwrap();

        assert_eq!(config.supervisor.services.len(), 2);
        assert!(matches!(
            config.supervisor.services[0].backing,
            Backing::Container { ref id } if id == "sandbox-redis"
        ));
        assert!(matches!(
            config.supervisor.services[1].backing,
            Backing::Process { ref command } if command == "python worker.py"
        ));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = Config::default();
        config.supervisor.services.push(ServiceDescriptor {
            name: "redis".to_string(),
            backing: Backing::Container {
                id: "sandbox-redis".to_string(),
            },
        });

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.supervisor.services.len(), 1);
        assert_eq!(parsed.supervisor.services[0].name, "redis");
    }
}
