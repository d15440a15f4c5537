//! HTTP route handlers for the API listener.

pub mod decide;
pub mod describe;
pub mod overrides;
pub mod profile;
pub mod reset;
pub mod stream;
pub mod track;

use axum::extract::rejection::FormRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::{Form, Json};
use serde::Deserialize;

use crate::auth::{IssueError, TokenResponse};
use crate::middleware::SDK_KEY_HEADER;
use crate::AppState;

/// Body shape shared by the user-scoped endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBody {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

fn token_form(
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<TokenRequest, IssueError> {
    match form {
        Ok(Form(req)) => Ok(req),
        Err(FormRejection::InvalidFormContentType(_)) => Err(IssueError::OAuth {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            code: "invalid_request",
            description: "token requests must be form encoded".to_string(),
        }),
        Err(_) => Err(IssueError::invalid_request("malformed token request")),
    }
}

fn validate_grant(req: &TokenRequest) -> Result<(String, String), IssueError> {
    let grant_type = req
        .grant_type
        .as_deref()
        .filter(|g| !g.is_empty())
        .ok_or_else(|| IssueError::invalid_request("grant_type is required"))?;
    if grant_type != "client_credentials" {
        return Err(IssueError::unsupported_grant_type());
    }
    let client_id = req
        .client_id
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(IssueError::invalid_client)?;
    let client_secret = req
        .client_secret
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(IssueError::invalid_client)?;
    Ok((client_id.to_string(), client_secret.to_string()))
}

/// `POST /oauth/token` on the API listener; tokens are scoped to the SDK
/// key the caller presents.
pub async fn api_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Json<TokenResponse>, IssueError> {
    let req = token_form(form)?;
    let (client_id, client_secret) = validate_grant(&req)?;
    let sdk_key = headers
        .get(SDK_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            IssueError::invalid_request("the X-Optimizely-SDK-Key header is required")
        })?;
    let token = state
        .api_issuer
        .issue_api_token(&client_id, &client_secret, sdk_key)?;
    Ok(Json(token))
}

/// `POST /oauth/token` on the admin listener.
pub async fn admin_token(
    State(state): State<AppState>,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Json<TokenResponse>, IssueError> {
    let req = token_form(form)?;
    let (client_id, client_secret) = validate_grant(&req)?;
    let token = state
        .admin_issuer
        .issue_admin_token(&client_id, &client_secret)?;
    Ok(Json(token))
}
