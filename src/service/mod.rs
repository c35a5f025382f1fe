// src/service/mod.rs

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigManager, ServiceConfig};
use crate::error::ErrorKind;
use crate::logging::Logger;
use crate::security::{
    generate_secret, AuthError, AuthService, Claims, CredentialHasher, IssuedToken, LoginResponse,
    RateLimiter, TokenService, UserRole, UserView,
};
use crate::storage::{ConfigTemplate, Store, StoreError, TemplateStore, UserStore, VmStore};
use crate::vm::{
    Firecracker, Hypervisor, LogEngine, LogEntry, LogFilter, Subscription, SubscriptionId,
    Supervisor, SupervisorSettings, VmConfig, VmError, VmMetrics, VmRecord, VmUpdate,
};

/// Service facade errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Config(_) => ErrorKind::Internal,
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::Auth(e) => e.kind(),
            ServiceError::Vm(e) => e.kind(),
            ServiceError::Store(e) => e.kind(),
        }
    }
}

/// Who is calling: the rate-limit key and the presented token
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub client_key: &'a str,
    pub token: &'a str,
}

impl<'a> Caller<'a> {
    pub fn new(client_key: &'a str, token: &'a str) -> Self {
        Self { client_key, token }
    }
}

/// Body of a template create or update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config: VmConfig,
}

/// Health of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub message: String,
}

impl ComponentHealth {
    fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            message: message.into(),
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: message.into(),
        }
    }
}

/// Service health summary
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub running_vms: usize,
    pub setup_required: bool,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Control plane entry point
///
/// Every operation except setup, login and refresh requires a valid token;
/// all of them are admitted through the rate limiter first.
pub struct Service {
    supervisor: Supervisor,
    logs: Arc<LogEngine>,
    templates: TemplateStore,
    auth: AuthService,
    limiter: RateLimiter,
    started: Instant,
    logger: Logger,
}

impl Service {
    /// Builds the service from configuration with the Firecracker hypervisor
    pub fn new(manager: &ConfigManager) -> Result<Self, ServiceError> {
        let config = manager.get_config();
        let logger = Logger::new("service");

        let store = Store::open(config)?;
        let secret = match manager.resolve_jwt_secret()? {
            Some(secret) => secret,
            None => load_or_create_secret(&config.secret_path(), &logger)?,
        };
        let hypervisor = Arc::new(Firecracker::new(logger.with_component("firecracker")));

        Self::from_parts(config, store, hypervisor, secret)
    }

    /// Builds the service from explicit parts
    pub fn from_parts(
        config: &ServiceConfig,
        store: Store,
        hypervisor: Arc<dyn Hypervisor>,
        secret: SecretString,
    ) -> Result<Self, ServiceError> {
        let logger = Logger::new("service");

        let logs = Arc::new(LogEngine::from_config(&config.logs, logger.with_component("logs")));
        let supervisor = Supervisor::new(
            VmStore::new(store.clone()),
            hypervisor,
            Arc::clone(&logs),
            SupervisorSettings::from(&config.hypervisor),
            logger.with_component("supervisor"),
        );

        let tokens = Arc::new(TokenService::new(
            &secret,
            config.auth.token_ttl_seconds,
            config.auth.issuer.clone(),
        ));
        let auth = AuthService::new(
            UserStore::new(store.clone()),
            tokens,
            CredentialHasher::new(&config.auth.password_hashing)?,
            config.auth.min_password_length,
            logger.with_component("auth"),
        );

        info!(
            parent: logger.span(),
            backend = ?config.storage.backend,
            rate_limit = config.rate_limit.requests,
            "service initialised"
        );

        Ok(Self {
            supervisor,
            logs,
            templates: TemplateStore::new(store),
            auth,
            limiter: RateLimiter::from_config(&config.rate_limit),
            started: Instant::now(),
            logger,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn log_engine(&self) -> &Arc<LogEngine> {
        &self.logs
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    /// Rate limiting only
    pub fn admit(&self, client_key: &str) -> Result<(), ServiceError> {
        if !self.limiter.allow(client_key) {
            debug!(parent: self.logger.span(), client = client_key, "request rate limited");
            return Err(AuthError::RateLimited.into());
        }
        Ok(())
    }

    /// Rate limiting, then token validation
    pub fn authorize(&self, caller: Caller<'_>) -> Result<Claims, ServiceError> {
        self.admit(caller.client_key)?;
        Ok(self.auth.validate_token(caller.token)?)
    }

    /// As [`Service::authorize`], additionally requiring the admin role
    pub fn authorize_admin(&self, caller: Caller<'_>) -> Result<Claims, ServiceError> {
        let claims = self.authorize(caller)?;
        if !claims.is_admin() {
            return Err(AuthError::Forbidden.into());
        }
        Ok(claims)
    }

    /// Drops rate-limit keys with no requests left in their window
    pub fn purge_rate_limits(&self) -> usize {
        self.limiter.purge()
    }

    // Authentication

    pub fn is_setup_required(&self) -> Result<bool, ServiceError> {
        Ok(self.auth.is_setup_required()?)
    }

    pub async fn setup(&self, client_key: &str, username: &str, password: &str) -> Result<UserView, ServiceError> {
        self.admit(client_key)?;
        Ok(self.auth.setup(username, password).await?)
    }

    pub async fn login(
        &self,
        client_key: &str,
        username: &str,
        password: &str,
    ) -> Result<LoginResponse, ServiceError> {
        self.admit(client_key)?;
        Ok(self.auth.login(username, password).await?)
    }

    pub fn refresh_token(&self, client_key: &str, token: &str) -> Result<IssuedToken, ServiceError> {
        self.admit(client_key)?;
        Ok(self.auth.refresh_token(token)?)
    }

    /// The caller's own user
    pub fn current_user(&self, caller: Caller<'_>) -> Result<UserView, ServiceError> {
        let claims = self.authorize(caller)?;
        Ok(self.auth.get_user(&claims.user_id)?)
    }

    pub async fn change_password(
        &self,
        caller: Caller<'_>,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), ServiceError> {
        let claims = self.authorize(caller)?;
        Ok(self
            .auth
            .change_password(&claims.user_id, current_password, new_password)
            .await?)
    }

    // User management (admin)

    pub fn list_users(&self, caller: Caller<'_>) -> Result<Vec<UserView>, ServiceError> {
        self.authorize_admin(caller)?;
        Ok(self.auth.list_users()?)
    }

    pub async fn create_user(
        &self,
        caller: Caller<'_>,
        username: &str,
        password: &str,
        role: UserRole,
    ) -> Result<UserView, ServiceError> {
        self.authorize_admin(caller)?;
        Ok(self.auth.create_user(username, password, role).await?)
    }

    pub fn delete_user(&self, caller: Caller<'_>, id: &str) -> Result<(), ServiceError> {
        let claims = self.authorize_admin(caller)?;
        if claims.user_id == id {
            return Err(ServiceError::Validation("cannot delete your own account".to_string()));
        }
        Ok(self.auth.delete_user(id)?)
    }

    // Virtual machines

    pub fn list_vms(&self, caller: Caller<'_>) -> Result<Vec<VmRecord>, ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.list()?)
    }

    pub fn get_vm(&self, caller: Caller<'_>, id: &str) -> Result<VmRecord, ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.get(id)?)
    }

    pub fn create_vm(&self, caller: Caller<'_>, config: VmConfig) -> Result<VmRecord, ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.create(config)?)
    }

    /// New VM from a stored template, optionally renamed
    pub fn create_vm_from_template(
        &self,
        caller: Caller<'_>,
        template_id: &str,
        name: Option<String>,
    ) -> Result<VmRecord, ServiceError> {
        self.authorize(caller)?;
        let mut config = self.templates.get(template_id)?.config;
        if let Some(name) = name {
            config.name = name;
        }
        Ok(self.supervisor.create(config)?)
    }

    pub async fn update_vm(&self, caller: Caller<'_>, id: &str, update: VmUpdate) -> Result<VmRecord, ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.update(id, update).await?)
    }

    pub async fn delete_vm(&self, caller: Caller<'_>, id: &str) -> Result<(), ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.delete(id).await?)
    }

    pub async fn start_vm(&self, caller: Caller<'_>, id: &str) -> Result<(), ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.start(id).await?)
    }

    pub async fn stop_vm(&self, caller: Caller<'_>, id: &str) -> Result<(), ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.stop(id).await?)
    }

    pub async fn shutdown_vm(&self, caller: Caller<'_>, id: &str) -> Result<(), ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.shutdown(id).await?)
    }

    pub async fn vm_metrics(&self, caller: Caller<'_>, id: &str) -> Result<VmMetrics, ServiceError> {
        self.authorize(caller)?;
        Ok(self.supervisor.get_metrics(id).await?)
    }

    // Logs

    /// Live log stream for a VM, starting with its retained history
    pub fn subscribe_logs(
        &self,
        caller: Caller<'_>,
        vm_id: &str,
        filter: LogFilter,
    ) -> Result<Subscription, ServiceError> {
        self.authorize(caller)?;
        self.supervisor.get(vm_id)?;
        Ok(self.logs.subscribe(vm_id, filter))
    }

    /// Closes a subscription; `false` if it was already gone
    pub fn unsubscribe_logs(
        &self,
        caller: Caller<'_>,
        id: SubscriptionId,
    ) -> Result<bool, ServiceError> {
        self.authorize(caller)?;
        Ok(self.logs.unsubscribe(id))
    }

    pub fn recent_logs(
        &self,
        caller: Caller<'_>,
        vm_id: &str,
        limit: usize,
    ) -> Result<Vec<Arc<LogEntry>>, ServiceError> {
        self.authorize(caller)?;
        self.supervisor.get(vm_id)?;
        Ok(self.logs.get_recent_logs(vm_id, limit))
    }

    // Configuration templates

    pub fn list_templates(&self, caller: Caller<'_>) -> Result<Vec<ConfigTemplate>, ServiceError> {
        self.authorize(caller)?;
        Ok(self.templates.list()?)
    }

    pub fn get_template(&self, caller: Caller<'_>, id: &str) -> Result<ConfigTemplate, ServiceError> {
        self.authorize(caller)?;
        Ok(self.templates.get(id)?)
    }

    pub fn create_template(
        &self,
        caller: Caller<'_>,
        request: TemplateRequest,
    ) -> Result<ConfigTemplate, ServiceError> {
        self.authorize(caller)?;
        validate_template(&request)?;

        let template = ConfigTemplate::new(request.name, request.description, request.config);
        self.templates.create(&template)?;
        info!(parent: self.logger.span(), template_id = %template.id, "template created");
        Ok(template)
    }

    /// Replaces name, description and configuration of a template
    pub fn update_template(
        &self,
        caller: Caller<'_>,
        id: &str,
        request: TemplateRequest,
    ) -> Result<ConfigTemplate, ServiceError> {
        self.authorize(caller)?;
        validate_template(&request)?;

        let mut template = self.templates.get(id)?;
        template.name = request.name;
        template.description = request.description;
        template.config = request.config;
        self.templates.update(&mut template)?;
        Ok(template)
    }

    pub fn delete_template(&self, caller: Caller<'_>, id: &str) -> Result<(), ServiceError> {
        self.authorize(caller)?;
        Ok(self.templates.delete(id)?)
    }

    // Lifecycle

    /// Unauthenticated health summary
    pub async fn health(&self) -> HealthStatus {
        let mut components = BTreeMap::new();
        let running_vms = self.supervisor.running_ids().await.len();
        components.insert(
            "supervisor".to_string(),
            ComponentHealth::healthy(format!("{running_vms} VM(s) running")),
        );

        let setup_required = match self.auth.is_setup_required() {
            Ok(required) => {
                components.insert("storage".to_string(), ComponentHealth::healthy("store reachable"));
                required
            }
            Err(e) => {
                components.insert("storage".to_string(), ComponentHealth::unhealthy(e.to_string()));
                false
            }
        };
        components.insert(
            "logs".to_string(),
            ComponentHealth::healthy(format!("{} subscriber(s)", self.logs.subscriber_count())),
        );

        let degraded = components.values().any(|c| c.status != "healthy");
        HealthStatus {
            status: if degraded { "degraded" } else { "healthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
            running_vms,
            setup_required,
            components,
        }
    }

    /// Stops every running VM
    pub async fn shutdown(&self) {
        info!(parent: self.logger.span(), "service shutting down");
        self.supervisor.stop_all().await;
    }
}

fn validate_template(request: &TemplateRequest) -> Result<(), ServiceError> {
    if request.name.trim().is_empty() {
        return Err(ServiceError::Validation("template name cannot be empty".to_string()));
    }
    request.config.validate().map_err(ServiceError::Validation)
}

/// Reads the persisted signing secret, or generates and persists a new one
///
/// A secret that cannot be persisted is still used for this run.
pub fn load_or_create_secret(path: &Path, logger: &Logger) -> Result<SecretString, ServiceError> {
    match fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => {
            debug!(parent: logger.span(), path = %path.display(), "loaded signing secret");
            return Ok(SecretString::new(contents.trim().to_string()));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(parent: logger.span(), path = %path.display(), error = %e, "cannot read signing secret, generating a new one");
        }
    }

    let secret = generate_secret()?;
    match persist_secret(path, &secret) {
        Ok(()) => info!(parent: logger.span(), path = %path.display(), "generated signing secret"),
        Err(e) => {
            warn!(parent: logger.span(), path = %path.display(), error = %e, "failed to persist signing secret; tokens will not survive a restart")
        }
    }
    Ok(SecretString::new(secret.as_str().to_string()))
}

fn persist_secret(path: &Path, secret: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret.as_bytes())
}
