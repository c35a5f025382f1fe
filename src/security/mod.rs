// Security subsystem

pub mod auth;
pub mod passwords;
pub mod rate_limit;
pub mod tokens;
pub mod user;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::storage::StoreError;

// Re-exports
pub use auth::{AuthService, LoginResponse};
pub use passwords::CredentialHasher;
pub use rate_limit::RateLimiter;
pub use tokens::{generate_secret, Claims, IssuedToken, TokenService};
pub use user::{User, UserRole, UserView};

/// Authentication and authorisation errors
///
/// Credential and token failures carry no detail on purpose.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("setup already completed")]
    SetupAlreadyDone,

    #[error("Password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("Username cannot be empty")]
    InvalidUsername,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("admin role required")]
    Forbidden,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error("Failed to generate signing secret")]
    SecretGeneration,

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl AuthError {
    /// Error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::InvalidCredentials => ErrorKind::InvalidCredentials,
            AuthError::InvalidToken => ErrorKind::InvalidToken,
            AuthError::SetupAlreadyDone | AuthError::UserAlreadyExists(_) => ErrorKind::Conflict,
            AuthError::WeakPassword(_) | AuthError::InvalidUsername => ErrorKind::Validation,
            AuthError::UserNotFound(_) => ErrorKind::NotFound,
            AuthError::RateLimited => ErrorKind::RateLimited,
            AuthError::Forbidden => ErrorKind::Forbidden,
            AuthError::Hashing(_) | AuthError::Signing(_) | AuthError::SecretGeneration => {
                ErrorKind::Internal
            }
            AuthError::Store(e) => e.kind(),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserAlreadyExists(name) => AuthError::UserAlreadyExists(name),
            StoreError::NotFound { key, .. } => AuthError::UserNotFound(key),
            other => AuthError::Store(other),
        }
    }
}
