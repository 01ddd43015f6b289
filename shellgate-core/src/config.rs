use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShellgateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub helper: HelperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared bearer token standing in for the console's auth gate.
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default)]
    pub default_shell: Option<String>,

    #[serde(default)]
    pub default_cwd: Option<String>,

    #[serde(default = "default_cols")]
    pub default_cols: u16,

    #[serde(default = "default_rows")]
    pub default_rows: u16,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_term")]
    pub term: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,

    #[serde(default = "default_idle_ceiling")]
    pub idle_ceiling_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    #[serde(default = "default_helper_binary")]
    pub binary: String,

    #[serde(default = "default_port_base")]
    pub port_base: u16,

    #[serde(default = "default_port_range")]
    pub port_range: u16,

    #[serde(default = "default_helper_bind")]
    pub bind_address: String,

    #[serde(default = "default_helper_username")]
    pub username: String,

    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    #[serde(default = "default_helper_shell")]
    pub shell: String,

    #[serde(default = "default_font_size")]
    pub font_size: u16,

    #[serde(default = "default_theme")]
    pub theme: String,
}

fn default_bind() -> String {
    "127.0.0.1:8960".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_max_sessions() -> usize {
    20
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_disconnect_grace() -> u64 {
    5 * 60
}

fn default_idle_ceiling() -> u64 {
    30 * 60
}

fn default_helper_binary() -> String {
    "ttyd".to_string()
}

fn default_port_base() -> u16 {
    7681
}

fn default_port_range() -> u16 {
    20
}

fn default_helper_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_helper_username() -> String {
    "admin".to_string()
}

fn default_startup_grace() -> u64 {
    1000
}

fn default_helper_shell() -> String {
    "bash".to_string()
}

fn default_font_size() -> u16 {
    14
}

fn default_theme() -> String {
    r##"{"background":"#1e1e1e","foreground":"#d4d4d4","cursor":"#aeafad"}"##.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            default_cwd: None,
            default_cols: default_cols(),
            default_rows: default_rows(),
            max_sessions: default_max_sessions(),
            term: default_term(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
            disconnect_grace_secs: default_disconnect_grace(),
            idle_ceiling_secs: default_idle_ceiling(),
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            binary: default_helper_binary(),
            port_base: default_port_base(),
            port_range: default_port_range(),
            bind_address: default_helper_bind(),
            username: default_helper_username(),
            startup_grace_ms: default_startup_grace(),
            shell: default_helper_shell(),
            font_size: default_font_size(),
            theme: default_theme(),
        }
    }
}

impl TerminalConfig {
    /// Shell used when a create request names none.
    pub fn shell(&self) -> String {
        self.default_shell
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/bash".to_string())
    }

    /// Working directory used when a create request names none.
    pub fn cwd(&self) -> PathBuf {
        self.default_cwd
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn idle_ceiling(&self) -> Duration {
        Duration::from_secs(self.idle_ceiling_secs)
    }
}

impl HelperConfig {
    /// Last port of the pool, inclusive.
    pub fn port_last(&self) -> u16 {
        self.port_base
            .saturating_add(self.port_range.saturating_sub(1))
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.port_base..=self.port_last()
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.port_range > 0 && port >= self.port_base && port <= self.port_last()
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

impl ShellgateConfig {
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from_paths(get_config_paths())
    }

    pub fn load_from_paths(paths: Vec<PathBuf>) -> Result<Self, ConfigLoadError> {
        load_dotenv_files();

        let mut builder = ConfigBuilder::builder();

        for path in paths {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SHELLGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut shellgate_config: ShellgateConfig = config.try_deserialize()?;

        if let Ok(level) = std::env::var("SHELLGATE_LOG_LEVEL") {
            shellgate_config.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            shellgate_config.logging.level = level;
        }

        if let Ok(token) = std::env::var("SHELLGATE_AUTH_TOKEN") {
            if !token.is_empty() {
                shellgate_config.server.auth_token = Some(token);
            }
        }

        shellgate_config.validate()?;

        Ok(shellgate_config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.server.bind.is_empty() {
            return Err(ConfigLoadError::MissingRequired("server.bind".to_string()));
        }

        if self.terminal.default_cols == 0 || self.terminal.default_rows == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "terminal.default_cols".to_string(),
                message: "Terminal geometry must be positive".to_string(),
            });
        }

        if self.terminal.max_sessions == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "terminal.max_sessions".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.reaper.interval_secs == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "reaper.interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.reaper.disconnect_grace_secs > self.reaper.idle_ceiling_secs {
            return Err(ConfigLoadError::InvalidValue {
                key: "reaper.disconnect_grace_secs".to_string(),
                message: "Cannot be greater than idle_ceiling_secs".to_string(),
            });
        }

        if self.helper.port_range == 0 {
            return Err(ConfigLoadError::InvalidValue {
                key: "helper.port_range".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if u32::from(self.helper.port_base) + u32::from(self.helper.port_range) - 1
            > u32::from(u16::MAX)
        {
            return Err(ConfigLoadError::InvalidValue {
                key: "helper.port_range".to_string(),
                message: format!(
                    "Pool starting at {} overflows the port space",
                    self.helper.port_base
                ),
            });
        }

        if self.helper.binary.is_empty() {
            return Err(ConfigLoadError::MissingRequired("helper.binary".to_string()));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level_lower = self.logging.level.to_lowercase();
        if !valid_levels.contains(&level_lower.as_str()) && !level_lower.contains('=') {
            return Err(ConfigLoadError::InvalidValue {
                key: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Must be one of: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        Ok(())
    }

    pub fn log_level(&self) -> &str {
        &self.logging.level
    }
}

fn get_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("config").join("default.toml"));
        paths.push(cwd.join("config").join("local.toml"));
        paths.push(cwd.join("shellgate.toml"));
    }

    if let Some(config_dir) = get_config_dir() {
        paths.push(config_dir.join("config.toml"));
    }

    paths
}

fn load_dotenv_files() {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
        paths.push(cwd.join(".env.local"));
    }

    if let Some(config_dir) = get_config_dir() {
        paths.push(config_dir.join(".env"));
    }

    for path in paths {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("shellgate"))
}
