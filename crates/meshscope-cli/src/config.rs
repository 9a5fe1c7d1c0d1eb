//! Load config from file and environment.

use anyhow::{Context, Result};
use meshscope_core::ListenerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Collector configuration. File: ~/.config/meshscope/config.toml or /etc/meshscope/config.toml.
/// Env overrides: MQTT_BROKER, MQTT_PORT, MQTT_USERNAME, MQTT_PASSWORD, ROOT_TOPIC, DB_PATH.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Broker host name (default mosquitto).
    #[serde(default = "default_broker")]
    pub mqtt_broker: String,
    /// Broker port (default 1883).
    #[serde(default = "default_port")]
    pub mqtt_port: u16,
    /// Broker user; empty connects anonymously.
    #[serde(default = "default_username")]
    pub mqtt_username: String,
    #[serde(default)]
    pub mqtt_password: String,
    /// Topic prefix subscribed with a trailing `#`.
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Seconds to wait before reconnecting (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_broker() -> String {
    "mosquitto".into()
}
fn default_port() -> u16 {
    1883
}
fn default_username() -> String {
    "mt".into()
}
fn default_root_topic() -> String {
    "msh/EU_868/2/e/LongFast/".into()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/nodes.db")
}
fn default_reconnect_delay() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_broker: default_broker(),
            mqtt_port: default_port(),
            mqtt_username: default_username(),
            mqtt_password: String::new(),
            root_topic: default_root_topic(),
            db_path: default_db_path(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl Config {
    /// Broker settings for the listener
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            host: self.mqtt_broker.clone(),
            port: self.mqtt_port,
            username: (!self.mqtt_username.is_empty()).then(|| self.mqtt_username.clone()),
            password: self.mqtt_password.clone(),
            root_topic: self.root_topic.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            ..ListenerConfig::default()
        }
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("MQTT_BROKER") {
            self.mqtt_broker = s;
        }
        if let Some(p) = lookup("MQTT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.mqtt_port = p;
        }
        if let Some(s) = lookup("MQTT_USERNAME") {
            self.mqtt_username = s;
        }
        if let Some(s) = lookup("MQTT_PASSWORD") {
            self.mqtt_password = s;
        }
        if let Some(s) = lookup("ROOT_TOPIC") {
            self.root_topic = s;
        }
        if let Some(s) = lookup("DB_PATH") {
            self.db_path = PathBuf::from(s);
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
///
/// An explicitly named file must exist and parse; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshscope/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshscope/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}
