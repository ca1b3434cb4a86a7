//! API error mapping: the shared error taxonomy onto HTTP statuses, with
//! one JSON shape `{ "error": "<message>" }` for every failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use dg_domain::error::Error;

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError(Error::NotFound("conversation 3".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(Error::PermissionDenied("not owner".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError(Error::Auth("expired".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(Error::Validation("bad body".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::Database("locked".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
