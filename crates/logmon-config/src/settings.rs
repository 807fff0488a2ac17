use crate::paths::{expand_tilde, AppPaths};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub defaults: Defaults,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
    pub servers: Vec<ServerConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfigLayer {
    pub logging: Option<LoggingConfigLayer>,
    pub timeouts: Option<TimeoutConfigLayer>,
}

impl AppConfigLayer {
    pub fn apply_to(self, cfg: &mut AppConfig) {
        if let Some(layer) = self.logging {
            cfg.logging.apply(layer);
        }
        if let Some(layer) = self.timeouts {
            cfg.timeouts.apply(layer);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: u16,
    pub tail_lines: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            ssh_key: None,
            ssh_port: 22,
            tail_lines: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub dial_secs: u64,
    pub keepalive_secs: u64,
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 15,
            dial_secs: 10,
            keepalive_secs: 5,
            shutdown_secs: 3,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }

    fn apply(&mut self, layer: TimeoutConfigLayer) {
        if let Some(v) = layer.connect_secs {
            self.connect_secs = v;
        }
        if let Some(v) = layer.dial_secs {
            self.dial_secs = v;
        }
        if let Some(v) = layer.keepalive_secs {
            self.keepalive_secs = v;
        }
        if let Some(v) = layer.shutdown_secs {
            self.shutdown_secs = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TimeoutConfigLayer {
    pub connect_secs: Option<u64>,
    pub dial_secs: Option<u64>,
    pub keepalive_secs: Option<u64>,
    pub shutdown_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stdout: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingConfigLayer {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub stdout: Option<bool>,
}

impl LoggingConfig {
    fn apply(&mut self, layer: LoggingConfigLayer) {
        if let Some(v) = layer.level {
            self.level = v;
        }
        if let Some(v) = layer.json {
            self.json = v;
        }
        if let Some(v) = layer.stdout {
            self.stdout = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogFolder {
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub file_patterns: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Key,
    Password,
    Agent,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub method: Option<AuthKind>,
    pub key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub log_folders: Vec<LogFolder>,
    #[serde(default)]
    pub sudo: bool,
}

impl ServerConfig {
    /// Folders to browse. A server configured with the single `log_path` form yields one
    /// unnamed folder built from `log_path` and `file_patterns`.
    pub fn effective_folders(&self) -> Vec<LogFolder> {
        if !self.log_folders.is_empty() {
            return self.log_folders.clone();
        }
        vec![LogFolder {
            name: String::new(),
            path: self.log_path.clone().unwrap_or_default(),
            file_patterns: self.file_patterns.clone(),
        }]
    }

    pub fn has_multiple_folders(&self) -> bool {
        self.log_folders.len() > 1
    }

    /// Identity shared by every server entry that reaches the same account.
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    pub fn auth_method(&self) -> AuthKind {
        self.auth.method.unwrap_or(AuthKind::Agent)
    }
}

impl AppConfig {
    pub fn find_server(&self, name: &str) -> Option<(usize, &ServerConfig)> {
        self.servers
            .iter()
            .enumerate()
            .find(|(_, s)| s.name.eq_ignore_ascii_case(name))
    }

    /// Fills in ports, auth methods and key paths from `[defaults]`.
    pub fn apply_defaults(&mut self) {
        let d = &mut self.defaults;
        if d.ssh_port == 0 {
            d.ssh_port = 22;
        }
        if d.tail_lines == 0 {
            d.tail_lines = 100;
        }
        d.ssh_key = d.ssh_key.as_deref().map(expand_tilde);

        let default_key = d.ssh_key.clone();
        let default_port = d.ssh_port;
        for s in &mut self.servers {
            if s.port == 0 {
                s.port = default_port;
            }
            if s.auth.method.is_none() {
                s.auth.method = Some(if default_key.is_some() {
                    AuthKind::Key
                } else {
                    AuthKind::Agent
                });
            }
            if s.auth.method == Some(AuthKind::Key) && s.auth.key_path.is_none() {
                s.auth.key_path = default_key.clone();
            }
            s.auth.key_path = s.auth.key_path.as_deref().map(expand_tilde);
            if s.name.is_empty() {
                s.name = format!("{}@{}", s.user, s.host);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers defined".to_string()));
        }
        for (i, s) in self.servers.iter().enumerate() {
            if s.host.is_empty() {
                return Err(ConfigError::Invalid(format!("server {i}: host is required")));
            }
            if s.user.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {i} ({}): user is required",
                    s.host
                )));
            }
            let has_log_path = s.log_path.as_deref().is_some_and(|p| !p.is_empty());
            let has_log_folders = !s.log_folders.is_empty();
            if has_log_path && has_log_folders {
                return Err(ConfigError::Invalid(format!(
                    "server {i} ({}): cannot set both log_path and log_folders",
                    s.host
                )));
            }
            if !has_log_path && !has_log_folders {
                return Err(ConfigError::Invalid(format!(
                    "server {i} ({}): log_path or log_folders is required",
                    s.host
                )));
            }
            for (j, f) in s.log_folders.iter().enumerate() {
                if f.name.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "server {i} ({}): log_folders[{j}]: name is required",
                        s.host
                    )));
                }
                if f.path.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "server {i} ({}): log_folders[{j}]: path is required",
                        s.host
                    )));
                }
            }
        }
        Ok(())
    }
}

const SAMPLE_CONFIG: &str = r#"# logmon configuration

[defaults]
# ssh_key = "~/.ssh/id_ed25519"
ssh_port = 22
tail_lines = 100

[timeouts]
connect_secs = 15
dial_secs = 10
keepalive_secs = 5
shutdown_secs = 3

[logging]
level = "info"
json = false
stdout = false

[[servers]]
name = "web-1"
host = "web-1.example.com"
user = "deploy"
auth = { method = "agent" }
log_path = "/var/log/nginx"
file_patterns = ["*.log*"]

[[servers]]
name = "db-1"
host = "db-1.example.com"
user = "ops"
sudo = true
auth = { method = "key", key_path = "~/.ssh/id_ed25519" }

[[servers.log_folders]]
name = "postgres"
path = "/var/log/postgresql"

[[servers.log_folders]]
name = "system"
path = "/var/log"
file_patterns = ["syslog*", "auth.log*"]
"#;

#[derive(Clone, Debug)]
pub struct ConfigManager {
    pub paths: AppPaths,
}

impl ConfigManager {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    /// Resolves the config file: an explicit path wins, then `logmon.toml` in `cwd`,
    /// then the per-user config file.
    pub fn resolve_path(&self, explicit: Option<&Path>, cwd: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(dir) = cwd {
            let project_path = AppPaths::project_config_path(dir);
            if project_path.exists() {
                return project_path;
            }
        }
        self.paths.config_file.clone()
    }

    pub fn load(
        &self,
        explicit: Option<&Path>,
        cwd: Option<&Path>,
        overrides: Option<AppConfigLayer>,
    ) -> Result<AppConfig> {
        let path = self.resolve_path(explicit, cwd);
        debug!(path = %path.display(), "loading config");
        let mut cfg = Self::load_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?;
        if let Some(layer) = overrides {
            layer.apply_to(&mut cfg);
        }
        Ok(cfg)
    }

    pub fn load_file(path: &Path) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<AppConfig, ConfigError> {
        let mut cfg: AppConfig = toml::from_str(content)?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_default(&self) -> Result<PathBuf> {
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.paths.config_file.exists() {
            anyhow::bail!(
                "config already exists at {}",
                self.paths.config_file.display()
            );
        }
        fs::write(&self.paths.config_file, SAMPLE_CONFIG)?;
        Ok(self.paths.config_file.clone())
    }
}
