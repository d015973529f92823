//! OAuth 2.0 token endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Deserialize;

use super::SharedState;

/// Form fields of a token request.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
}

fn grant_error(error: &str, description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": error, "error_description": description})),
    )
        .into_response()
}

/// POST /oauth2/token
pub async fn issue_token(
    State(state): State<SharedState>,
    Form(request): Form<TokenRequest>,
) -> Response {
    let mut state = state.write().await;
    state.token_requests += 1;

    let Some(policy) = state.oauth.as_mut() else {
        return grant_error("invalid_client", "OAuth is not enabled");
    };
    if request.client_id != policy.client_id || request.client_secret != policy.client_secret {
        return grant_error("invalid_client", "Unknown client");
    }
    if request.grant_type != "refresh_token" {
        return grant_error("unsupported_grant_type", "Only refresh_token is supported");
    }
    if request.refresh_token.as_deref() != Some(policy.refresh_token.as_str()) {
        return grant_error("invalid_grant", "Bad refresh token");
    }

    policy.issued += 1;
    let token = format!("access-{}", policy.issued);
    policy.access_token = Some(token.clone());
    tracing::debug!(token = %token, "issued access token");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": 3600
        })),
    )
        .into_response()
}
