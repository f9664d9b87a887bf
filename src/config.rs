// Configuration. Either a YAML file passed with `--yaml`, or environment
// variables (a `.env` file in the working directory is loaded first by
// `main`). Both paths produce the same `Config`, which is validated before
// anything connects.
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable {0} must be set")]
    MissingVar(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidVar { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Subscribe to sensor readings over MQTT and record them in DuckDB.
#[derive(Parser, Debug)]
#[command(name = "soil-recorder")]
#[command(version)]
pub struct Args {
    /// Path to YAML file used for configuration. Environment variables are used when omitted.
    #[arg(long, value_name = "PATH/TO/YAML")]
    pub yaml: Option<PathBuf>,
}

/// How a reading is written when its topic already has rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Every reading becomes a new row.
    #[default]
    Insert,
    /// One row per topic, replaced by the latest reading.
    Upsert,
}

impl FromStr for WriteMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(WriteMode::Insert),
            "upsert" => Ok(WriteMode::Upsert),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_true")]
    pub tls: bool,

    /// Quality of service requested for every subscription (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    /// DuckDB file. In-memory when absent.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default)]
    pub write_mode: WriteMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: None,
            table: default_table(),
            write_mode: WriteMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Serve `/metrics` and `/health` on this address when set.
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

fn default_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "soil-recorder".to_string()
}

fn default_true() -> bool {
    true
}

fn default_qos() -> u8 {
    2
}

fn default_keep_alive() -> u64 {
    30
}

fn default_table() -> String {
    "readings".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["mock/moisture".to_string(), "mock/saturation".to_string()]
}

impl Config {
    /// Load from the YAML file given on the command line, else from the environment.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        match &args.yaml {
            Some(path) => Self::from_yaml_file(path),
            None => Self::from_env(),
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, empty values count as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mqtt = MqttConfig {
            host: var("HOST").ok_or(ConfigError::MissingVar("HOST"))?,
            port: parse_var(var("PORT"), "PORT")?.unwrap_or_else(default_port),
            username: var("USERNAME"),
            password: var("PASSWORD"),
            client_id: var("CLIENT_ID").unwrap_or_else(default_client_id),
            tls: parse_bool(var("MQTT_TLS"), "MQTT_TLS")?.unwrap_or(true),
            qos: parse_var(var("QOS"), "QOS")?.unwrap_or_else(default_qos),
            keep_alive_secs: parse_var(var("KEEP_ALIVE_SECS"), "KEEP_ALIVE_SECS")?
                .unwrap_or_else(default_keep_alive),
        };

        let write_mode = match var("WRITE_MODE") {
            Some(v) => v
                .parse::<WriteMode>()
                .map_err(|_| ConfigError::InvalidVar { key: "WRITE_MODE", value: v })?,
            None => WriteMode::default(),
        };

        let database = DatabaseConfig {
            path: var("DB_URL"),
            table: var("TABLE").unwrap_or_else(default_table),
            write_mode,
        };

        let topics = match var("TOPICS") {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => default_topics(),
        };

        let config = Config {
            mqtt,
            database,
            topics,
            metrics_listen: parse_var(var("METRICS_LISTEN"), "METRICS_LISTEN")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt host must not be empty".into()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt port must not be 0".into()));
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        // The table name ends up in SQL text, so it has to be a plain identifier.
        if !is_identifier(&self.database.table) {
            return Err(ConfigError::Invalid(format!(
                "table name {:?} is not a valid identifier",
                self.database.table
            )));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid("topic list contains an empty entry".into()));
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_var<T: FromStr>(
    value: Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match value {
        Some(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { key, value: v }),
        None => Ok(None),
    }
}

fn parse_bool(value: Option<String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidVar { key, value: v }),
        },
    }
}
