use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use recast_core::error::{ApiError, ErrorEnvelope};
use recast_transcoder::TranscodeError;

/// Newtype wrapper so we can implement `IntoResponse` in this crate.
pub struct AppError(pub ApiError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = ErrorEnvelope::from(&self.0);
        (status, Json(envelope)).into_response()
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl From<TranscodeError> for AppError {
    fn from(e: TranscodeError) -> Self {
        let api = match e {
            TranscodeError::Spawn(err) => ApiError::Internal(err.to_string()),
            TranscodeError::NotFound(key) => ApiError::NotFound(format!("no live transcode for {key}")),
            TranscodeError::ShuttingDown => ApiError::Unavailable("server is shutting down".into()),
        };
        Self(api)
    }
}
