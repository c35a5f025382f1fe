// src/security/auth.rs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::logging::Logger;
use crate::security::passwords::{validate_strength, CredentialHasher};
use crate::security::tokens::{Claims, IssuedToken, TokenService};
use crate::security::user::{User, UserRole, UserView};
use crate::security::AuthError;
use crate::storage::UserStore;

/// Password behind the stand-in hash checked for unknown usernames
const DUMMY_PASSWORD: &str = "agni-unknown-user";

/// Successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserView,
}

/// Credential checks, first-run setup and user management
pub struct AuthService {
    users: UserStore,
    tokens: Arc<TokenService>,
    hasher: CredentialHasher,
    min_password_length: usize,
    logger: Logger,
    /// Hashed on first use with the configured parameters
    dummy_hash: OnceCell<String>,
}

impl AuthService {
    pub fn new(
        users: UserStore,
        tokens: Arc<TokenService>,
        hasher: CredentialHasher,
        min_password_length: usize,
        logger: Logger,
    ) -> Self {
        Self {
            users,
            tokens,
            hasher,
            min_password_length,
            logger,
            dummy_hash: OnceCell::new(),
        }
    }

    /// Token service backing this instance
    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    fn check_username(username: &str) -> Result<(), AuthError> {
        if username.trim().is_empty() {
            return Err(AuthError::InvalidUsername);
        }
        Ok(())
    }

    /// Creates the first user as admin; refused once any user exists
    pub async fn setup(&self, username: &str, password: &str) -> Result<UserView, AuthError> {
        if !self.users.is_setup_required()? {
            return Err(AuthError::SetupAlreadyDone);
        }
        Self::check_username(username)?;
        validate_strength(password, self.min_password_length)?;

        let hash = self.hasher.hash_async(password).await?;
        let user = User::new(username, hash, UserRole::Admin);

        // a concurrent setup may have won while we were hashing
        if !self.users.create_if_empty(&user)? {
            return Err(AuthError::SetupAlreadyDone);
        }

        info!(parent: &self.logger.user_span(&user.id), username, "initial admin created");
        Ok(user.view())
    }

    /// Verifies credentials and issues a token
    ///
    /// Unknown users and wrong passwords produce the same error.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let user = match self.users.get_by_username(username) {
            Ok(user) => user,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // pay the same hashing cost as a wrong password
                let dummy = self
                    .dummy_hash
                    .get_or_try_init(|| self.hasher.hash_async(DUMMY_PASSWORD))
                    .await?;
                self.hasher.verify_async(password, dummy).await;
                increment_counter!("agni_login_failures_total");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        if !self.hasher.verify_async(password, &user.password_hash).await {
            increment_counter!("agni_login_failures_total");
            return Err(AuthError::InvalidCredentials);
        }

        let span = self.logger.user_span(&user.id);
        if let Err(e) = self.users.update_last_login(&user.id) {
            warn!(parent: &span, error = %e, "failed to record last login");
        }

        let issued = self.tokens.generate_token(&user)?;
        increment_counter!("agni_logins_total");
        info!(parent: &span, username, "user logged in");

        let user = self.users.get(&user.id).unwrap_or(user);
        Ok(LoginResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            user: user.view(),
        })
    }

    /// Verifies a token
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens.validate_token(token)
    }

    /// Issues a fresh token for a still-valid one
    pub fn refresh_token(&self, token: &str) -> Result<IssuedToken, AuthError> {
        self.tokens.refresh_token(token)
    }

    /// True while no user exists
    pub fn is_setup_required(&self) -> Result<bool, AuthError> {
        Ok(self.users.is_setup_required()?)
    }

    pub fn get_user(&self, id: &str) -> Result<UserView, AuthError> {
        Ok(self.users.get(id)?.view())
    }

    pub fn list_users(&self) -> Result<Vec<UserView>, AuthError> {
        Ok(self.users.list()?.iter().map(UserView::from).collect())
    }

    /// Adds a user with an explicit role
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: UserRole,
    ) -> Result<UserView, AuthError> {
        Self::check_username(username)?;
        validate_strength(password, self.min_password_length)?;

        let hash = self.hasher.hash_async(password).await?;
        let user = User::new(username, hash, role);
        self.users.create(&user)?;

        info!(parent: &self.logger.user_span(&user.id), username, role = %role, "user created");
        Ok(user.view())
    }

    /// Replaces a password after checking the current one
    pub async fn change_password(
        &self,
        user_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let mut user = self.users.get(user_id)?;

        if !self.hasher.verify_async(current_password, &user.password_hash).await {
            return Err(AuthError::InvalidCredentials);
        }
        validate_strength(new_password, self.min_password_length)?;

        user.password_hash = self.hasher.hash_async(new_password).await?;
        self.users.update(&mut user)?;

        info!(parent: &self.logger.user_span(user_id), "password changed");
        Ok(())
    }

    pub fn delete_user(&self, id: &str) -> Result<(), AuthError> {
        self.users.delete(id)?;
        info!(parent: &self.logger.user_span(id), "user deleted");
        Ok(())
    }
}
