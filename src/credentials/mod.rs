//! Credential generation for new instances.
//!
//! Secrets are random alphanumeric strings. Role tokens are HS256 JWTs signed
//! with the instance's own signing secret and valid for one year.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{InstanceError, InstanceResult};
use crate::registry::Credentials;

/// Issuer embedded in every role token
pub const TOKEN_ISSUER: &str = "instance-manager";

/// Default password length
pub const DEFAULT_SECRET_LENGTH: usize = 16;

const SIGNING_SECRET_LENGTH: usize = 64;
const TOKEN_VALIDITY_DAYS: i64 = 365;

pub const ANON_ROLE: &str = "anon";
pub const SERVICE_ROLE: &str = "service_role";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleClaims {
    pub role: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Random alphanumeric string of `length` characters.
pub fn generate_secret(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn generate_signing_secret() -> String {
    generate_secret(SIGNING_SECRET_LENGTH)
}

/// Sign a role token with `secret`.
pub fn sign_token(role: &str, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = RoleClaims {
        role: role.to_string(),
        iss: TOKEN_ISSUER.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::days(TOKEN_VALIDITY_DAYS)).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify a role token against `secret` and return its claims.
pub fn verify_token(token: &str, secret: &str) -> Result<RoleClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation.set_required_spec_claims(&["exp", "iss"]);

    let data = decode::<RoleClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Sign a token and immediately check that it verifies with the same role.
fn sign_verified(role: &str, secret: &str) -> InstanceResult<String> {
    let failed = |source| InstanceError::TokenVerificationFailed {
        role: role.to_string(),
        source,
    };

    let token = sign_token(role, secret).map_err(failed)?;
    let claims = verify_token(&token, secret).map_err(failed)?;
    if claims.role != role {
        return Err(failed(jsonwebtoken::errors::ErrorKind::InvalidToken.into()));
    }

    tracing::debug!(role = %role, "Role token verified");
    Ok(token)
}

/// Overrides a caller may supply for the dashboard login.
#[derive(Debug, Clone, Default)]
pub struct DashboardLogin {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Mint the full credential set for a new instance.
///
/// Fails if either role token does not verify against the freshly generated
/// signing secret.
pub fn generate_credentials(dashboard: &DashboardLogin) -> InstanceResult<Credentials> {
    let jwt_secret = generate_signing_secret();
    let anon_key = sign_verified(ANON_ROLE, &jwt_secret)?;
    let service_role_key = sign_verified(SERVICE_ROLE, &jwt_secret)?;

    Ok(Credentials {
        db_password: generate_secret(DEFAULT_SECRET_LENGTH),
        jwt_secret,
        anon_key,
        service_role_key,
        dashboard_username: dashboard
            .username
            .clone()
            .unwrap_or_else(|| "admin".to_string()),
        dashboard_password: dashboard
            .password
            .clone()
            .unwrap_or_else(|| generate_secret(DEFAULT_SECRET_LENGTH)),
        vault_enc_key: generate_secret(32),
        analytics_api_key: generate_secret(24),
    })
}
