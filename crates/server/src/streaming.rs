use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::Response;
use recast_core::error::ApiError;
use recast_core::types::OutputFormat;
use recast_transcoder::{TaskId, TaskKey, TaskRegistry, TranscodeError};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::paths;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    pub path: Option<String>,
}

/// GET/HEAD /convert.mp4?path=…
pub async fn convert_mp4(
    state: State<AppState>,
    method: Method,
    query: Query<ConvertQuery>,
) -> Result<Response, AppError> {
    convert(state, method, query, OutputFormat::Mp4).await
}

/// GET/HEAD /convert.webm?path=…
pub async fn convert_webm(
    state: State<AppState>,
    method: Method,
    query: Query<ConvertQuery>,
) -> Result<Response, AppError> {
    convert(state, method, query, OutputFormat::Webm).await
}

/// Start (or join) the transcode of `path` and stream its output from the
/// first byte. HEAD only makes sure the transcode is running.
async fn convert(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<ConvertQuery>,
    format: OutputFormat,
) -> Result<Response, AppError> {
    let requested = query
        .path
        .ok_or_else(|| ApiError::BadRequest("missing `path` query parameter".into()))?;
    let source = paths::resolve_file(&state.root, &requested)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("{requested}: no such file")))?;

    let key = TaskKey::new(source, format);
    info!(%method, %key, "convert request");
    state.registry.start(&key).await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format.content_type());

    if method == Method::HEAD {
        return response
            .body(Body::empty())
            .map_err(|e| ApiError::Internal(format!("build response: {e}")).into());
    }

    let reader = state.registry.attach(&key).await.map_err(attach_error)?;
    let detach = DetachOnDrop {
        registry: state.registry.clone(),
        key: key.clone(),
        task_id: reader.task_id(),
    };

    let stream = async_stream::stream! {
        let _detach = detach;
        let mut reader = reader;
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => yield Ok(chunk),
                Ok(None) => break,
                Err(e) => {
                    warn!(key = %reader.key(), error = %e, "transcode stream failed");
                    yield Err(e);
                    break;
                }
            }
        }
    };

    response
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("build response: {e}")).into())
}

/// The task was started moments ago, so a missing task here means it failed
/// and was evicted before the reader got in.
fn attach_error(err: TranscodeError) -> AppError {
    match err {
        TranscodeError::NotFound(key) => {
            ApiError::Internal(format!("transcode of {key} stopped before streaming")).into()
        }
        other => other.into(),
    }
}

/// Releases the reader's task reference once the response body is finished
/// or dropped by a disconnecting client.
struct DetachOnDrop {
    registry: TaskRegistry,
    key: TaskKey,
    task_id: TaskId,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "no runtime to detach reader on");
            return;
        };
        let registry = self.registry.clone();
        let key = self.key.clone();
        let task_id = self.task_id;
        runtime.spawn(async move {
            if let Err(e) = registry.detach(&key, task_id).await {
                debug!(%key, %task_id, error = %e, "detach skipped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn vanished_task_is_a_server_error() {
        let key = TaskKey::new("/media/pilot.mkv", OutputFormat::Mp4);
        let resp = attach_error(TranscodeError::NotFound(key)).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = attach_error(TranscodeError::ShuttingDown).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
