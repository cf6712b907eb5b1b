//! # configs
//!
//! Immutable process settings, resolved once at startup from (lowest to
//! highest precedence) built-in defaults, an optional TOML file and `IIS_*`
//! environment variables (`.env` is loaded first). The resulting value is
//! handed to constructors; nothing reads configuration globally afterwards.

use config::{Config, Environment, File, FileFormat};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Key shipped in sample configs. Accepted; callers should warn about it.
pub const DEVELOPMENT_KEY: &str = "0123456789abcdef";
pub const MIN_SECRET_LEN: usize = 16;

const DEFAULT_CONFIG_PATH: &str = "config/iis";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn secret_from_string<'de, D: Deserializer<'de>>(de: D) -> Result<SecretString, D::Error> {
    String::deserialize(de).map(SecretString::from)
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Signs tokens, peppers password hashes and salts IP hashes.
    #[serde(deserialize_with = "secret_from_string")]
    pub secret_key: SecretString,

    /// The one account allowed to use a reserved username prefix.
    #[serde(default = "default_admin_name")]
    pub admin_name: String,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub tokens: TokenSettings,

    #[serde(default)]
    pub limits: LimitSettings,

    #[serde(default)]
    pub password: PasswordSettings,

    #[serde(default)]
    pub log: LogSettings,
}

fn default_admin_name() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Absent means the in-process cache is used.
    pub redis_url: Option<String>,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
            redis_url: None,
            cache_ttl_secs: 600,
            cache_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub session_ttl_secs: i64,
    pub challenge_ttl_secs: i64,
    /// Digits in a captcha answer
    pub challenge_length: usize,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: 365 * 86400,
            challenge_ttl_secs: 300,
            challenge_length: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_mentions: usize,
    pub max_tags: usize,
    /// Extra attempts per ancestor when reply propagation hits a transient fault
    pub propagation_retries: u32,
    pub max_thread_depth: usize,
    /// Read-modify-write attempts before a contended update gives up
    pub cas_retries: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_mentions: 8,
            max_tags: 4,
            propagation_retries: 3,
            max_thread_depth: 1024,
            cas_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PasswordSettings {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordSettings {
    fn default() -> Self {
        Self { memory_kib: 19 * 1024, iterations: 2, parallelism: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

impl Settings {
    /// Loads `.env`, then `$IIS_CONFIG` (or `config/iis.toml`) if present,
    /// then `IIS_*` variables, e.g. `IIS_SECRET_KEY`, `IIS_STORE__BACKEND`.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path = std::env::var("IIS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("IIS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings from an inline TOML document only.
    pub fn from_toml(doc: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(doc, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn secret_bytes(&self) -> &[u8] {
        self.secret_key.expose_secret().as_bytes()
    }

    pub fn uses_development_key(&self) -> bool {
        self.secret_key.expose_secret() == DEVELOPMENT_KEY
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret = self.secret_key.expose_secret();
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!("secret_key must be at least {MIN_SECRET_LEN} bytes")));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigError::Invalid("store.database_url is required for the postgres backend".into()));
        }
        if self.store.cache_capacity == 0 {
            return Err(ConfigError::Invalid("store.cache_capacity must be positive".into()));
        }
        if self.limits.max_thread_depth == 0 || self.limits.cas_retries == 0 {
            return Err(ConfigError::Invalid("limits.max_thread_depth and limits.cas_retries must be positive".into()));
        }
        if self.admin_name.trim().is_empty() {
            return Err(ConfigError::Invalid("admin_name must not be empty".into()));
        }
        Ok(())
    }
}
