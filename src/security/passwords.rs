// src/security/passwords.rs

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::config::PasswordHashingConfig;
use crate::security::AuthError;

/// Salted Argon2id hashing with configurable cost
#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    /// Builds a hasher from cost parameters
    pub fn new(config: &PasswordHashingConfig) -> Result<Self, AuthError> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| AuthError::Hashing(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hashes a password into a PHC string
    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Hashing(e.to_string()))
    }

    /// Checks a password against a PHC string; malformed hashes never verify
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self.argon2().verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }

    /// [`hash`](Self::hash) on the blocking pool
    pub async fn hash_async(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.clone();
        let password = zeroize::Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))?
    }

    /// [`verify`](Self::verify) on the blocking pool
    pub async fn verify_async(&self, password: &str, hash: &str) -> bool {
        let hasher = self.clone();
        let password = zeroize::Zeroizing::new(password.to_string());
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .unwrap_or(false)
    }
}

/// Minimum-strength check: at least `min_length` characters
pub fn validate_strength(password: &str, min_length: usize) -> Result<(), AuthError> {
    if password.chars().count() < min_length {
        return Err(AuthError::WeakPassword(min_length));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fast_hasher() -> CredentialHasher {
        CredentialHasher::new(&PasswordHashingConfig {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn hashes_are_salted_and_verifiable() {
        let hasher = fast_hasher();
        let a = hasher.hash("goodpassword1").unwrap();
        let b = hasher.hash("goodpassword1").unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with("$argon2id$"));
        assert!(hasher.verify("goodpassword1", &a));
        assert!(!hasher.verify("wrongpassword", &a));
        assert!(!hasher.verify("goodpassword1", "not-a-phc-string"));
    }

    #[test]
    fn strength_is_counted_in_characters() {
        assert!(validate_strength("short", 8).is_err());
        assert!(validate_strength("12345678", 8).is_ok());
        assert!(validate_strength("ééééééé", 8).is_err());
    }

    #[test]
    fn zero_cost_is_rejected() {
        let config = PasswordHashingConfig {
            memory_kib: 0,
            iterations: 1,
            parallelism: 1,
        };
        assert!(CredentialHasher::new(&config).is_err());
    }

    #[tokio::test]
    async fn async_variants_match() {
        let hasher = fast_hasher();
        let hash = hasher.hash_async("goodpassword1").await.unwrap();
        assert!(hasher.verify_async("goodpassword1", &hash).await);
        assert!(!hasher.verify_async("nope", &hash).await);
    }
}
