use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config as Cfg, File};
use serde::Deserialize;

use crate::error::AppError;

/// Server configuration. Sections map 1:1 onto `morrigan.toml` tables and
/// can be overridden with `MORRIGAN__`-prefixed environment variables
/// (e.g. `MORRIGAN__HTTP__PORT=8443`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Active components and their freeform specs, keyed by component name.
    /// The spec value is handed to the component's `setup` untouched.
    #[serde(default = "default_components")]
    pub components: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub connection_string: Option<String>,
    #[serde(default = "default_dbname")]
    pub dbname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_console")]
    pub console: bool,
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Initial password for the bootstrap `admin` identity. Required the
    /// first time the server starts against an empty identity collection.
    pub bootstrap_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Session heartbeat period in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Signing key rotation interval in seconds. Non-positive values switch
    /// to regenerating the key pair after every issuance.
    #[serde(default = "default_rotation_secs")]
    pub rotation_interval_secs: i64,
}

fn default_port() -> u16 {
    3000
}

fn default_dbname() -> String {
    "test".to_string()
}

fn default_console() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/morrigan.server/state")
}

fn default_rotation_secs() -> i64 {
    // 6 h, inside the 4-8 h rotation band.
    6 * 60 * 60
}

fn default_components() -> HashMap<String, serde_json::Value> {
    let mut components = HashMap::new();
    components.insert("auth".to_string(), serde_json::json!({}));
    components.insert("client".to_string(), serde_json::json!({}));
    components
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            secure: false,
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            dbname: default_dbname(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            console: default_console(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            logger: LoggerConfig::default(),
            state_dir: default_state_dir(),
            auth: AuthConfig::default(),
            token: TokenConfig::default(),
            connection: ConnectionConfig::default(),
            components: default_components(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("morrigan").required(false))
            .add_source(config::Environment::with_prefix("MORRIGAN").separator("__"))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on contradictions a later startup step would only hit at an
    /// awkward time.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.http.secure {
            let cert = self.http.cert_path.as_ref().ok_or_else(|| {
                AppError::Configuration("http.secure requires http.cert_path".to_string())
            })?;
            let key = self.http.key_path.as_ref().ok_or_else(|| {
                AppError::Configuration("http.secure requires http.key_path".to_string())
            })?;
            if !cert.is_file() {
                return Err(AppError::Configuration(format!(
                    "certificate file {} does not exist",
                    cert.display()
                )));
            }
            if !key.is_file() {
                return Err(AppError::Configuration(format!(
                    "key file {} does not exist",
                    key.display()
                )));
            }
        }

        if self.database.dbname == "test" {
            tracing::warn!("database.dbname not set, using default database 'test'");
        }

        Ok(())
    }
}
