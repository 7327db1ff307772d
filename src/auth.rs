use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

const JWT_AUDIENCE: &str = "authenticated";

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    sub: String,
}

/// Resolves the calling user from the request headers or fails with 401.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    let token = bearer_token(headers);

    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(user_id);
        }
        if token.is_none() {
            if let Some(user_id) = state.config.default_user_id.clone() {
                return Ok(user_id);
            }
        }
    }

    let Some(token) = token else {
        return Err(AppError::Unauthorized(
            "Unauthorized: missing bearer token.".to_string(),
        ));
    };

    if let Some(secret) = state.config.supabase_jwt_secret.as_deref() {
        return verify_jwt(&token, secret);
    }
    fetch_remote_user_id(state, &token).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn verify_jwt(token: &str, secret: &str) -> AppResult<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[JWT_AUDIENCE]);

    let data = decode::<AccessTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "Rejected access token");
        AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
    })?;

    let user_id = data.claims.sub.trim();
    if user_id.is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }
    Ok(user_id.to_string())
}

async fn fetch_remote_user_id(state: &AppState, token: &str) -> AppResult<String> {
    let (Some(base_url), Some(service_key)) = (
        state.config.supabase_url.as_deref(),
        state.config.supabase_service_role_key.as_deref(),
    ) else {
        return Err(AppError::ServiceUnavailable(
            "Authentication is not configured. Set SUPABASE_JWT_SECRET or SUPABASE_URL."
                .to_string(),
        ));
    };

    let url = auth_user_url(base_url)?;
    let response = state
        .http_client
        .get(url)
        .header("Authorization", format!("Bearer {token}"))
        .header("apikey", service_key)
        .send()
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "Auth provider request failed");
            AppError::Dependency("Auth provider request failed.".to_string())
        })?;

    match response.status() {
        status if status.is_success() => {}
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(AppError::Unauthorized(
                "Unauthorized: invalid or expired token.".to_string(),
            ));
        }
        status => {
            tracing::error!(status = %status, "Auth provider returned an unexpected status");
            return Err(AppError::Dependency(
                "Auth provider request failed.".to_string(),
            ));
        }
    }

    let body = response.json::<Value>().await.map_err(|error| {
        tracing::error!(error = %error, "Auth provider returned invalid JSON");
        AppError::Dependency("Auth provider returned an invalid response.".to_string())
    })?;

    body.get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: unknown user.".to_string()))
}

fn auth_user_url(base_url: &str) -> AppResult<Url> {
    Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
        .and_then(|base| base.join("auth/v1/user"))
        .map_err(|error| {
            tracing::error!(error = %error, "SUPABASE_URL is not a valid URL");
            AppError::ServiceUnavailable("Authentication is misconfigured.".to_string())
        })
}
