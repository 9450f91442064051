use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use entity::customer;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use platform_api::{ApiError, ApiResult};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "atelier_session";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub session_ttl_minutes: i64,
}

impl AuthConfig {
    pub fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_secret(self.jwt_secret.as_bytes())
    }

    pub fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(self.jwt_secret.as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(Role::User),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl From<customer::Role> for Role {
    fn from(value: customer::Role) -> Self {
        match value {
            customer::Role::User => Role::User,
            customer::Role::Admin => Role::Admin,
        }
    }
}

impl From<Role> for customer::Role {
    fn from(value: Role) -> Self {
        match value {
            Role::User => customer::Role::User,
            Role::Admin => customer::Role::Admin,
        }
    }
}

/// The caller of a service operation. Built per request from the session
/// token and the stored customer row; never read from ambient state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Session {
    pub customer_id: Uuid,
    pub role: Role,
}

impl Session {
    pub fn new(customer_id: Uuid, role: Role) -> Self {
        Self { customer_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> ApiResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    /// Admins see every customer's data, customers only their own.
    pub fn can_view(&self, customer_id: Uuid) -> bool {
        self.is_admin() || self.customer_id == customer_id
    }
}

impl From<&customer::Model> for Session {
    fn from(model: &customer::Model) -> Self {
        Session::new(model.id, model.role.into())
    }
}

pub fn issue_token(
    customer_id: Uuid,
    role: Role,
    config: &AuthConfig,
) -> jsonwebtoken::errors::Result<String> {
    let now = Utc::now();
    let exp = now
        .checked_add_signed(Duration::minutes(config.session_ttl_minutes))
        .unwrap_or(now)
        .timestamp() as usize;
    let claims = SessionClaims {
        sub: customer_id,
        role: role.as_str().to_string(),
        exp,
        iat: now.timestamp() as usize,
    };
    jsonwebtoken::encode(&Header::default(), &claims, &config.encoding_key())
}

pub fn decode_token(
    token: &str,
    config: &AuthConfig,
) -> jsonwebtoken::errors::Result<SessionClaims> {
    jsonwebtoken::decode::<SessionClaims>(token, &config.decoding_key(), &Validation::default())
        .map(|data| data.claims)
}

pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ApiError::internal(anyhow::anyhow!("hash error: {}", err)))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".into(),
            session_ttl_minutes: 30,
        }
    }

    #[test]
    fn token_carries_customer_and_role() {
        let id = Uuid::new_v4();
        let token = issue_token(id, Role::Admin, &config()).unwrap();
        let claims = decode_token(&token, &config()).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(Role::parse(&claims.role), Some(Role::Admin));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = issue_token(Uuid::new_v4(), Role::User, &config()).unwrap();
        let other = AuthConfig {
            jwt_secret: "another".into(),
            ..config()
        };
        assert!(decode_token(&token, &other).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let expired = AuthConfig {
            session_ttl_minutes: -120,
            ..config()
        };
        let token = issue_token(Uuid::new_v4(), Role::User, &expired).unwrap();
        assert!(decode_token(&token, &config()).is_err());
    }

    #[test]
    fn password_hash_verifies_only_its_password() {
        let hash = hash_password("9999999999").unwrap();
        assert!(verify_password("9999999999", &hash));
        assert!(!verify_password("0000000000", &hash));
        assert!(!verify_password("9999999999", "not-a-hash"));
    }

    #[test]
    fn sessions_gate_admin_and_ownership() {
        let owner = Uuid::new_v4();
        let user = Session::new(owner, Role::User);
        assert!(user.require_admin().is_err());
        assert!(user.can_view(owner));
        assert!(!user.can_view(Uuid::new_v4()));

        let admin = Session::new(Uuid::new_v4(), Role::Admin);
        assert!(admin.require_admin().is_ok());
        assert!(admin.can_view(owner));
    }
}
