//! Bearer-JWT authentication. Tokens carry `{sub, exp}` (compatible with
//! external issuers); the subject is resolved to a live user row on every
//! request, so deactivation takes effect immediately.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use dg_domain::error::Error;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
struct Claims {
    /// User id; external issuers send either a number or a string.
    sub: serde_json::Value,
    #[allow(dead_code)]
    exp: usize,
}

fn decode_user_id(token: &str, secret: &str, algorithm: &str) -> Result<i64, Error> {
    let alg: Algorithm = algorithm
        .parse()
        .map_err(|_| Error::Config(format!("unknown JWT algorithm '{algorithm}'")))?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(alg),
    )
    .map_err(|e| Error::Auth(format!("invalid token: {e}")))?;

    match &data.claims.sub {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::Auth("token subject is not an integer".into())),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| Error::Auth("token subject is not an integer".into())),
        _ => Err(Error::Auth("token has no usable subject".into())),
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError(Error::Auth("missing authentication token".into())))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError(Error::Auth("expected a Bearer token".into())))?;

        let user_id = decode_user_id(
            token,
            &state.config.auth.jwt_secret,
            &state.config.auth.jwt_algorithm,
        )?;

        let user = state
            .repo
            .get_user(user_id)
            .await?
            .ok_or_else(|| ApiError(Error::Auth("user not found".into())))?;
        if !user.is_active {
            return Err(ApiError(Error::Auth("user is inactive".into())));
        }

        Ok(CurrentUser {
            id: user.id,
            username: user.username,
            is_admin: user.is_admin,
        })
    }
}

/// Extractor for admin-only endpoints.
pub struct RequireAdmin(pub CurrentUser);

#[axum::async_trait]
impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(ApiError(Error::PermissionDenied(
                "admin access required".into(),
            )));
        }
        Ok(RequireAdmin(user))
    }
}
