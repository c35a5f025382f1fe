// src/config/mod.rs

pub mod validator;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Prefix for environment variable overrides (`AGNI__AUTH__TOKEN_TTL_SECONDS=3600`)
pub const ENV_PREFIX: &str = "AGNI";

/// Complete configuration for the control plane service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Configuration format version
    pub version: String,

    /// Directory holding the database, sockets and the signing secret
    pub data_dir: PathBuf,

    /// Hypervisor process configuration
    pub hypervisor: HypervisorConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Ingress rate limiting
    pub rate_limit: RateLimitConfig,

    /// Log distribution configuration
    pub logs: LogsConfig,

    /// Durable store configuration
    pub storage: StorageConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Hypervisor process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Path to the firecracker binary (None = look it up on PATH)
    pub binary: Option<PathBuf>,

    /// Path to the jailer binary used when a VM declares jailer parameters
    pub jailer_binary: Option<PathBuf>,

    /// Directory for control sockets and metrics files
    pub socket_dir: PathBuf,

    /// Upper bound on waiting for a launched process to accept its configuration
    pub launch_timeout_ms: u64,

    /// Timeout for a single control-socket request
    pub request_timeout_ms: u64,
}

impl HypervisorConfig {
    /// Launch confirmation timeout
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    /// Control request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Session token lifetime in seconds
    pub token_ttl_seconds: i64,

    /// Issuer claim written into tokens
    pub issuer: String,

    /// Token signing secret (None = load or generate `<data_dir>/.jwt_secret`)
    pub jwt_secret: Option<SecretSource>,

    /// Minimum accepted password length
    pub min_password_length: usize,

    /// Password hashing cost
    pub password_hashing: PasswordHashingConfig,
}

/// Argon2 cost parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PasswordHashingConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,

    /// Number of passes
    pub iterations: u32,

    /// Degree of parallelism
    pub parallelism: u32,
}

/// Sliding-window rate limit configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window and client key
    pub requests: usize,

    /// Window length in seconds
    pub window_seconds: u64,
}

/// Log distribution configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Entries retained per VM
    pub history_capacity: usize,

    /// Queue capacity of each subscription
    pub subscriber_capacity: usize,
}

/// Durable store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile in-process map
    Memory,

    /// SQLite database file
    Sqlite,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: StorageBackend,

    /// Database path (defaults to `<data_dir>/agni.db`)
    pub path: Option<PathBuf>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Prometheus metrics configuration
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to expose the Prometheus endpoint
    pub enabled: bool,

    /// Listen address for the exporter
    pub listen_addr: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,

    /// Whether to log to stdout
    pub log_to_stdout: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Log file path (if log_to_file is true)
    pub log_file: Option<String>,

    /// Log format
    pub format: LogFormat,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Error level
    Error,

    /// Warning level
    Warning,

    /// Info level
    Info,

    /// Debug level
    Debug,

    /// Trace level
    Trace,
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Plain text
    Plain,

    /// JSON format
    Json,
}

/// Where a secret value comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// Literal value
    Value(String),

    /// Reference of the form `env:NAME` or `file:/path`
    Reference(String),
}

/// Configuration manager
#[derive(Debug)]
pub struct ConfigManager {
    /// Current active configuration
    config: ServiceConfig,

    /// Configuration file path
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a new configuration manager with a default configuration
    pub fn new() -> Self {
        Self {
            config: Self::default_config(),
            config_path: None,
        }
    }

    /// Wraps an already-built configuration after validating it
    pub fn from_config(config: ServiceConfig) -> Result<Self, ConfigError> {
        let manager = Self {
            config,
            config_path: None,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Loads configuration from a file, layered with `AGNI__*` environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileReadError {
                path: path.display().to_string(),
                error: "file does not exist".to_string(),
            });
        }

        let defaults = serde_yaml::to_string(&Self::default_config())
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        let config: ServiceConfig = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Yaml))
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let manager = Self {
            config,
            config_path: Some(path.to_path_buf()),
        };

        manager.validate()?;

        info!("Configuration loaded from {}", path.display());

        Ok(manager)
    }

    /// Saves the current configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config_str = self.to_yaml()?;

        fs::write(&path, config_str).map_err(|e| ConfigError::FileWriteError {
            path: path.as_ref().to_string_lossy().into_owned(),
            error: e.to_string(),
        })?;

        info!("Configuration saved to {}", path.as_ref().display());

        Ok(())
    }

    /// Renders the current configuration as YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.config).map_err(|e| ConfigError::SerializationError(e.to_string()))
    }

    /// Validates the current configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validator::ConfigValidator::new().validate(&self.config)?;
        debug!("Configuration validated successfully");
        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Path the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Replaces the current configuration
    pub fn update_config(&mut self, config: ServiceConfig) -> Result<(), ConfigError> {
        validator::ConfigValidator::new().validate(&config)?;
        self.config = config;
        Ok(())
    }

    /// Resolves the configured token signing secret, if one is configured
    pub fn resolve_jwt_secret(&self) -> Result<Option<SecretString>, ConfigError> {
        match &self.config.auth.jwt_secret {
            Some(source) => {
                let value = resolve_secret_source(source)?;
                debug!("Resolved token signing secret");
                Ok(Some(SecretString::new(value)))
            }
            None => Ok(None),
        }
    }

    /// Creates a default configuration
    pub fn default_config() -> ServiceConfig {
        let data_dir = default_data_dir();
        ServiceConfig {
            version: "1.0".to_string(),
            hypervisor: HypervisorConfig {
                binary: None,
                jailer_binary: None,
                socket_dir: std::env::temp_dir(),
                launch_timeout_ms: 5_000,
                request_timeout_ms: 2_000,
            },
            auth: AuthConfig {
                token_ttl_seconds: 24 * 60 * 60,
                issuer: "agni".to_string(),
                jwt_secret: None,
                min_password_length: 8,
                password_hashing: PasswordHashingConfig {
                    memory_kib: 19 * 1024,
                    iterations: 2,
                    parallelism: 1,
                },
            },
            rate_limit: RateLimitConfig {
                requests: 100,
                window_seconds: 60,
            },
            logs: LogsConfig {
                history_capacity: 1000,
                subscriber_capacity: 100,
            },
            storage: StorageConfig {
                backend: StorageBackend::Sqlite,
                path: None,
            },
            observability: ObservabilityConfig {
                metrics: MetricsConfig {
                    enabled: false,
                    listen_addr: SocketAddr::from(([127, 0, 0, 1], 9464)),
                },
                logging: LoggingConfig {
                    level: LogLevel::Info,
                    log_to_stdout: true,
                    log_to_file: false,
                    log_file: None,
                    format: LogFormat::Plain,
                },
            },
            data_dir,
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceConfig {
    /// Effective database path
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("agni.db"))
    }

    /// Location of the persisted signing secret
    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join(".jwt_secret")
    }
}

/// `$XDG_DATA_HOME/agni`, falling back to `~/.local/share/agni`, then `/tmp/agni`
pub fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("agni");
        }
    }

    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".local").join("share").join("agni"),
        _ => PathBuf::from("/tmp/agni"),
    }
}

/// Resolves a secret source to its actual value
pub fn resolve_secret_source(source: &SecretSource) -> Result<String, ConfigError> {
    match source {
        SecretSource::Value(value) => Ok(value.clone()),
        SecretSource::Reference(reference) => {
            let (source_type, source_path) = reference
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidSecretReference(reference.clone()))?;

            match source_type {
                "env" => std::env::var(source_path).map_err(|_| ConfigError::SecretResolutionError {
                    reference: reference.clone(),
                    error: format!("Environment variable {} not found", source_path),
                }),
                "file" => fs::read_to_string(source_path)
                    .map_err(|e| ConfigError::SecretResolutionError {
                        reference: reference.clone(),
                        error: format!("Failed to read file {}: {}", source_path, e),
                    })
                    .map(|s| s.trim().to_string()),
                _ => Err(ConfigError::InvalidSecretSource(source_type.to_string())),
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError {
        path: String,
        error: String,
    },

    #[error("Failed to write configuration file {path}: {error}")]
    FileWriteError {
        path: String,
        error: String,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid secret reference: {0}")]
    InvalidSecretReference(String),

    #[error("Invalid secret source: {0}")]
    InvalidSecretSource(String),

    #[error("Failed to resolve secret {reference}: {error}")]
    SecretResolutionError {
        reference: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let manager = ConfigManager::new();
        assert!(manager.validate().is_ok());
        assert_eq!(manager.get_config().logs.history_capacity, 1000);
        assert_eq!(manager.get_config().logs.subscriber_capacity, 100);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agni.yaml");
        fs::write(
            &path,
            "rate_limit:\n  requests: 5\n  window_seconds: 10\nstorage:\n  backend: memory\n",
        )
        .unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        let config = manager.get_config();

        assert_eq!(config.rate_limit.requests, 5);
        assert_eq!(config.rate_limit.window_seconds, 10);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        // untouched sections keep their defaults
        assert_eq!(config.auth.min_password_length, 8);
        assert_eq!(manager.config_path(), Some(path.as_path()));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ConfigManager::load_from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agni.yaml");
        fs::write(&path, "logs:\n  history_capacity: 0\n  subscriber_capacity: 10\n").unwrap();

        let err = ConfigManager::load_from_file(&path).err().unwrap();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn save_and_reload_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.yaml");

        let mut config = ConfigManager::default_config();
        config.rate_limit.requests = 42;
        let manager = ConfigManager::from_config(config).unwrap();
        manager.save_to_file(&path).unwrap();

        let reloaded = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(reloaded.get_config().rate_limit.requests, 42);
    }

    #[test]
    fn secret_sources_resolve() {
        assert_eq!(
            resolve_secret_source(&SecretSource::Value("abc".into())).unwrap(),
            "abc"
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        let reference = format!("file:{}", file.path().display());
        assert_eq!(
            resolve_secret_source(&SecretSource::Reference(reference)).unwrap(),
            "from-file"
        );

        assert!(matches!(
            resolve_secret_source(&SecretSource::Reference("vault:x".into())),
            Err(ConfigError::InvalidSecretSource(_))
        ));
        assert!(matches!(
            resolve_secret_source(&SecretSource::Reference("no-colon".into())),
            Err(ConfigError::InvalidSecretReference(_))
        ));
        match resolve_secret_source(&SecretSource::Reference("env:AGNI_TEST_SURELY_UNSET".into())) {
            Err(e @ ConfigError::SecretResolutionError { .. }) => {
                assert!(e.to_string().contains("env:AGNI_TEST_SURELY_UNSET"));
                assert!(std::error::Error::source(&e).is_none());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn configured_jwt_secret_is_resolved() {
        let mut config = ConfigManager::default_config();
        config.auth.jwt_secret = Some(SecretSource::Value("s3cret".into()));
        let manager = ConfigManager::from_config(config).unwrap();

        let secret = manager.resolve_jwt_secret().unwrap().unwrap();
        assert_eq!(secret.expose_secret(), "s3cret");
    }
}
