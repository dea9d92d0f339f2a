use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::info;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Login address of the bot account
    pub login: String,

    /// Account password
    #[serde(default)]
    pub password: String,

    /// Chat server host
    pub server: String,

    /// Chat server port
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Operator addresses that receive notices and relayed messages.
    /// Accepts either a list or a single whitespace-separated string.
    #[serde(deserialize_with = "deserialize_recipients")]
    pub report_users: Vec<String>,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Application root used as working directory for shell commands
    #[serde(default)]
    pub workdir: Option<String>,

    /// URL pinged by `@app restart` after touching the restart file
    #[serde(default)]
    pub restart_url: Option<String>,

    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout(),
            send_timeout_secs: default_timeout(),
            keep_alive_secs: default_keep_alive(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

fn default_server_port() -> u16 {
    5222
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    "hostchat".to_string()
}

fn default_shell_timeout() -> u64 {
    30
}

/// Split a whitespace-separated address list, dropping empty entries.
pub fn split_addresses(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn deserialize_recipients<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Recipients {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Recipients::deserialize(deserializer)? {
        Recipients::One(raw) => split_addresses(&raw),
        Recipients::Many(list) => list.iter().flat_map(|s| split_addresses(s)).collect(),
    })
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(login = %config.login, server = %config.server, "configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create default configuration for an account reporting to the given
    /// operators
    pub fn default_for(login: String, server: String, report_users: Vec<String>) -> Self {
        Self {
            report_users,
            login,
            password: String::new(),
            server,
            server_port: default_server_port(),
            heartbeat: HeartbeatConfig::default(),
            transport: TransportConfig::default(),
            commands: CommandsConfig {
                shell_timeout_secs: default_shell_timeout(),
                ..CommandsConfig::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.login.trim().is_empty() {
            return Err(ConfigError::Invalid("login must not be empty".into()));
        }
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server must not be empty".into()));
        }
        if self.report_users.is_empty() {
            return Err(ConfigError::Invalid(
                "report_users must name at least one address".into(),
            ));
        }
        // The bot's own inbox would feed every relay back to itself
        if self.report_users.iter().any(|user| user == &self.login) {
            return Err(ConfigError::Invalid(
                "report_users must not contain the bot's own login".into(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be positive".into(),
            ));
        }
        if self.transport.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "transport.keep_alive_secs must be at least 5".into(),
            ));
        }
        Ok(())
    }
}
