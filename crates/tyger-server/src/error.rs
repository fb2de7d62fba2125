//! Maps a [`TygerError`] onto the wire error shape from spec §6/§7:
//! `{"error":{"code":"...","message":"..."}}` plus the matching status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tyger_types::TygerError;

pub struct ApiError(pub TygerError);

impl From<TygerError> for ApiError {
    fn from(err: TygerError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error serving request");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: kind.code(),
                message: self.0.message().to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
