// src/config/validator.rs

use crate::config::{
    AuthConfig, ConfigError, HypervisorConfig, LogsConfig, ObservabilityConfig, RateLimitConfig,
    ServiceConfig, StorageBackend, StorageConfig,
};

/// Supported configuration format versions
const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Passwords shorter than this are never acceptable, whatever the configuration says
const MIN_PASSWORD_LENGTH_FLOOR: usize = 8;

/// Configuration validator
pub struct ConfigValidator {}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates a configuration
    pub fn validate(&self, config: &ServiceConfig) -> Result<(), ConfigError> {
        if config.version.is_empty() {
            return Err(ConfigError::ValidationError(
                "Configuration version cannot be empty".to_string(),
            ));
        }

        if !SUPPORTED_VERSIONS.contains(&config.version.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unsupported configuration version: {}",
                config.version
            )));
        }

        if config.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Data directory cannot be empty".to_string(),
            ));
        }

        self.validate_hypervisor(&config.hypervisor)?;
        self.validate_auth(&config.auth)?;
        self.validate_rate_limit(&config.rate_limit)?;
        self.validate_logs(&config.logs)?;
        self.validate_storage(&config.storage)?;
        self.validate_observability(&config.observability)?;

        Ok(())
    }

    fn validate_hypervisor(&self, hypervisor: &HypervisorConfig) -> Result<(), ConfigError> {
        if hypervisor.launch_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Launch timeout cannot be zero".to_string(),
            ));
        }

        if hypervisor.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Request timeout cannot be zero".to_string(),
            ));
        }

        if hypervisor.socket_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Socket directory cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_auth(&self, auth: &AuthConfig) -> Result<(), ConfigError> {
        if auth.token_ttl_seconds <= 0 {
            return Err(ConfigError::ValidationError(
                "Token TTL must be positive".to_string(),
            ));
        }

        if auth.issuer.is_empty() {
            return Err(ConfigError::ValidationError(
                "Token issuer cannot be empty".to_string(),
            ));
        }

        if auth.min_password_length < MIN_PASSWORD_LENGTH_FLOOR {
            return Err(ConfigError::ValidationError(format!(
                "Minimum password length must be at least {}",
                MIN_PASSWORD_LENGTH_FLOOR
            )));
        }

        let hashing = &auth.password_hashing;
        if hashing.memory_kib == 0 || hashing.iterations == 0 || hashing.parallelism == 0 {
            return Err(ConfigError::ValidationError(
                "Password hashing parameters must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_rate_limit(&self, rate_limit: &RateLimitConfig) -> Result<(), ConfigError> {
        if rate_limit.requests == 0 {
            return Err(ConfigError::ValidationError(
                "Rate limit must admit at least one request".to_string(),
            ));
        }

        if rate_limit.window_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "Rate limit window cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_logs(&self, logs: &LogsConfig) -> Result<(), ConfigError> {
        if logs.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Log history capacity cannot be zero".to_string(),
            ));
        }

        if logs.subscriber_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Log subscriber capacity cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_storage(&self, storage: &StorageConfig) -> Result<(), ConfigError> {
        if storage.backend == StorageBackend::Sqlite {
            if let Some(path) = &storage.path {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "SQLite database path cannot be empty".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_observability(&self, observability: &ObservabilityConfig) -> Result<(), ConfigError> {
        let logging = &observability.logging;
        if logging.log_to_file && logging.log_file.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ValidationError(
                "Log file path must be set when file logging is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use std::path::PathBuf;

    fn check(mutate: impl FnOnce(&mut ServiceConfig)) -> Result<(), ConfigError> {
        let mut config = ConfigManager::default_config();
        mutate(&mut config);
        ConfigValidator::new().validate(&config)
    }

    #[test]
    fn defaults_pass() {
        assert!(check(|_| {}).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(check(|c| c.version = String::new()).is_err());
        assert!(check(|c| c.version = "9.9".into()).is_err());
        assert!(check(|c| c.hypervisor.launch_timeout_ms = 0).is_err());
        assert!(check(|c| c.auth.token_ttl_seconds = 0).is_err());
        assert!(check(|c| c.auth.min_password_length = 4).is_err());
        assert!(check(|c| c.auth.password_hashing.iterations = 0).is_err());
        assert!(check(|c| c.rate_limit.requests = 0).is_err());
        assert!(check(|c| c.rate_limit.window_seconds = 0).is_err());
        assert!(check(|c| c.logs.subscriber_capacity = 0).is_err());
        assert!(check(|c| c.storage.path = Some(PathBuf::new())).is_err());
        assert!(check(|c| c.observability.logging.log_to_file = true).is_err());
    }

    #[test]
    fn memory_backend_ignores_path() {
        assert!(check(|c| {
            c.storage.backend = StorageBackend::Memory;
            c.storage.path = Some(PathBuf::new());
        })
        .is_ok());
    }
}
