//! Service auth: an OAuth2 client-credentials token endpoint and the JWT
//! verification used by the API and admin listeners.
//!
//! Client secrets are configured as base64 of the SHA-256 digest of the
//! secret; authentication hashes the presented secret and compares the
//! digests in constant time.  Tokens are HS256 over the configured HMAC
//! secret list; the first secret signs, every secret verifies.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::ServiceAuthConfig;
use crate::error::CoreError;

const DEFAULT_TTL_SECS: i64 = 30 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sdk_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub admin: bool,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// Token-endpoint failures use the OAuth error body, except for a
/// misconfigured issuer which is a plain 500.
#[derive(Debug)]
pub enum IssueError {
    OAuth {
        status: StatusCode,
        code: &'static str,
        description: String,
    },
    Disabled,
}

impl IssueError {
    fn oauth(status: StatusCode, code: &'static str, description: impl Into<String>) -> Self {
        Self::OAuth {
            status,
            code,
            description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::oauth(StatusCode::BAD_REQUEST, "invalid_request", description)
    }

    pub fn invalid_client() -> Self {
        Self::oauth(
            StatusCode::UNAUTHORIZED,
            "invalid_client",
            "invalid client credentials",
        )
    }

    pub fn unsupported_grant_type() -> Self {
        Self::oauth(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            "only client_credentials is supported",
        )
    }
}

impl IntoResponse for IssueError {
    fn into_response(self) -> Response {
        match self {
            Self::OAuth {
                status,
                code,
                description,
            } => {
                let body = serde_json::json!({
                    "error": code,
                    "error_description": description,
                });
                (status, Json(body)).into_response()
            }
            Self::Disabled => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "token issuance is not configured",
            )
                .into_response(),
        }
    }
}

pub struct TokenIssuer {
    cfg: ServiceAuthConfig,
    ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(cfg: &ServiceAuthConfig) -> Self {
        let ttl = cfg.ttl.as_duration().as_secs() as i64;
        Self {
            cfg: cfg.clone(),
            ttl_secs: if ttl > 0 { ttl } else { DEFAULT_TTL_SECS },
        }
    }

    fn signing_secret(&self) -> Option<&str> {
        self.cfg
            .hmac_secrets
            .iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
    }

    fn authenticate(&self, client_id: &str, client_secret: &str) -> Result<(), IssueError> {
        let client = self
            .cfg
            .clients
            .iter()
            .find(|c| c.id == client_id)
            .ok_or_else(IssueError::invalid_client)?;
        let stored = BASE64
            .decode(&client.secret_hash)
            .map_err(|_| IssueError::invalid_client())?;
        let presented = Sha256::digest(client_secret.as_bytes());
        if stored.ct_eq(presented.as_slice()).into() {
            Ok(())
        } else {
            Err(IssueError::invalid_client())
        }
    }

    fn sign(&self, claims: &TokenClaims) -> Result<TokenResponse, IssueError> {
        let secret = self.signing_secret().ok_or(IssueError::Disabled)?;
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|_| IssueError::Disabled)?;
        Ok(TokenResponse {
            access_token: token,
            token_type: "bearer",
            expires_in: self.ttl_secs,
        })
    }

    fn expiry(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.ttl_secs
    }

    /// API token: scoped to the SDK key the caller presented.
    pub fn issue_api_token(
        &self,
        client_id: &str,
        client_secret: &str,
        sdk_key: &str,
    ) -> Result<TokenResponse, IssueError> {
        self.authenticate(client_id, client_secret)?;
        self.sign(&TokenClaims {
            iss: "flagrelay".to_string(),
            exp: self.expiry(),
            sdk_keys: vec![sdk_key.to_string()],
            admin: false,
        })
    }

    pub fn issue_admin_token(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenResponse, IssueError> {
        self.authenticate(client_id, client_secret)?;
        self.sign(&TokenClaims {
            iss: "flagrelay".to_string(),
            exp: self.expiry(),
            sdk_keys: Vec::new(),
            admin: true,
        })
    }
}

/// Request verification for one listener.
pub enum Verifier {
    /// No secrets and no clients configured: everything passes.
    NoAuth,
    Hmac { secrets: Vec<String> },
}

impl Verifier {
    pub fn from_config(cfg: &ServiceAuthConfig) -> Self {
        let secrets: Vec<String> = cfg
            .hmac_secrets
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        if secrets.is_empty() && cfg.clients.is_empty() {
            return Self::NoAuth;
        }
        if cfg.jwks_url.is_some() {
            tracing::warn!("jwksURL is configured but tokens are validated against hmacSecrets");
        }
        Self::Hmac { secrets }
    }

    /// `Ok(None)` means auth is disabled for this listener.
    pub fn verify(&self, headers: &HeaderMap) -> Result<Option<TokenClaims>, CoreError> {
        let secrets = match self {
            Self::NoAuth => return Ok(None),
            Self::Hmac { secrets } => secrets,
        };
        let token = extract_token(headers)
            .ok_or_else(|| CoreError::Unauthorized("missing bearer token".to_string()))?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        for secret in secrets {
            let result = jsonwebtoken::decode::<TokenClaims>(
                token,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            );
            if let Ok(data) = result {
                return Ok(Some(data.claims));
            }
        }
        Err(CoreError::Unauthorized("invalid token".to_string()))
    }
}

/// Claims from a verified API token must cover the request's SDK key.
pub fn check_api_access(claims: &TokenClaims, sdk_key: &str) -> Result<(), CoreError> {
    if claims.sdk_keys.iter().any(|k| k == sdk_key) {
        Ok(())
    } else {
        Err(CoreError::Unauthorized(
            "token is not valid for this SDK key".to_string(),
        ))
    }
}

pub fn check_admin_access(claims: &TokenClaims) -> Result<(), CoreError> {
    if claims.admin {
        Ok(())
    } else {
        Err(CoreError::Unauthorized(
            "token does not grant admin access".to_string(),
        ))
    }
}

/// Header precedence: `Authorization: Bearer`, `Authorization: JWT`,
/// `Jwt`, `Auth`.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        for prefix in ["Bearer ", "JWT "] {
            if let Some(token) = value.strip_prefix(prefix) {
                return Some(token.trim());
            }
        }
    }
    for name in ["jwt", "auth"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Helper for building config fixtures.
pub fn hash_secret(secret: &str) -> String {
    BASE64.encode(Sha256::digest(secret.as_bytes()))
}
