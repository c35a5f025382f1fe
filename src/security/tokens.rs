// src/security/tokens.rs

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::security::user::{User, UserRole};
use crate::security::AuthError;

/// Length in bytes of generated signing secrets
pub const SECRET_KEY_LENGTH: usize = 32;

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Signed session claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub iss: String,
    pub sub: String,
}

impl Claims {
    /// Expiry as a timestamp
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }

    /// Whether the claims carry the admin role
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// A freshly signed token
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Generates a hex-encoded random signing secret
pub fn generate_secret() -> Result<Zeroizing<String>, AuthError> {
    let mut bytes = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
    SystemRandom::new()
        .fill(&mut bytes[..])
        .map_err(|_| AuthError::SecretGeneration)?;
    Ok(Zeroizing::new(hex::encode(&bytes[..])))
}

/// HS256 token issuance and validation
///
/// Tokens are stateless: validity depends only on signature and time window,
/// so a refreshed token does not revoke its predecessor.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    issuer: String,
}

impl TokenService {
    /// Creates a service signing with `secret`
    pub fn new(secret: &SecretString, ttl_seconds: i64, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let key = secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            ttl: Duration::seconds(ttl_seconds),
            issuer,
        }
    }

    /// Configured lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a token for a user
    pub fn generate_token(&self, user: &User) -> Result<IssuedToken, AuthError> {
        self.issue(&user.id, &user.username, user.role)
    }

    fn issue(&self, user_id: &str, username: &str, role: UserRole) -> Result<IssuedToken, AuthError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;

        let claims = Claims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verifies signature, algorithm, issuer and time window
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(reason = %e, "token rejected");
                AuthError::InvalidToken
            })
    }

    /// Validates `token` and issues a new one for the same identity
    pub fn refresh_token(&self, token: &str) -> Result<IssuedToken, AuthError> {
        let claims = self.validate_token(token)?;
        self.issue(&claims.user_id, &claims.username, claims.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    fn admin() -> User {
        User::new("admin", "x".into(), UserRole::Admin)
    }

    #[test]
    fn generated_secrets_are_hex_and_distinct() {
        let a = generate_secret().unwrap();
        let b = generate_secret().unwrap();
        assert_eq!(a.len(), SECRET_KEY_LENGTH * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(*a, *b);
    }

    #[test]
    fn issued_tokens_validate_to_the_same_identity() {
        let service = TokenService::new(&secret("k"), 3600, "agni");
        let user = admin();

        let issued = service.generate_token(&user).unwrap();
        let claims = service.validate_token(&issued.token).unwrap();

        assert_eq!(claims.user_id, user.id);
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.username, "admin");
        assert_eq!(claims.role, UserRole::Admin);
        assert_eq!(claims.iss, "agni");
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(claims.expires_at().timestamp(), issued.expires_at.timestamp());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let service = TokenService::new(&secret("k"), -60, "agni");
        let issued = service.generate_token(&admin()).unwrap();
        assert!(matches!(
            service.validate_token(&issued.token),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            service.refresh_token(&issued.token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn foreign_secret_issuer_or_algorithm_is_rejected() {
        let ours = TokenService::new(&secret("k"), 3600, "agni");
        let theirs = TokenService::new(&secret("other"), 3600, "agni");
        let other_issuer = TokenService::new(&secret("k"), 3600, "someone-else");

        let token = theirs.generate_token(&admin()).unwrap().token;
        assert!(ours.validate_token(&token).is_err());

        let token = other_issuer.generate_token(&admin()).unwrap().token;
        assert!(ours.validate_token(&token).is_err());

        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: "u".into(),
            username: "u".into(),
            role: UserRole::User,
            iat: now,
            exp: now + 3600,
            nbf: now,
            iss: "agni".into(),
            sub: "u".into(),
        };
        let hs512 = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        assert!(ours.validate_token(&hs512).is_err());

        assert!(ours.validate_token("garbage").is_err());
    }

    #[test]
    fn not_yet_valid_tokens_are_rejected() {
        let service = TokenService::new(&secret("k"), 3600, "agni");
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: "u".into(),
            username: "u".into(),
            role: UserRole::User,
            iat: now,
            exp: now + 7200,
            nbf: now + 3600,
            iss: "agni".into(),
            sub: "u".into(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"k")).unwrap();
        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn refresh_keeps_identity() {
        let service = TokenService::new(&secret("k"), 3600, "agni");
        let user = User::new("bob", "x".into(), UserRole::User);
        let issued = service.generate_token(&user).unwrap();

        let refreshed = service.refresh_token(&issued.token).unwrap();
        let claims = service.validate_token(&refreshed.token).unwrap();
        assert_eq!(claims.user_id, user.id);
        assert_eq!(claims.role, UserRole::User);
        // the old token stays valid until its own expiry
        assert!(service.validate_token(&issued.token).is_ok());
    }
}
