use axum::Json;
use axum::extract::{FromRequest, Request};
use axum::extract::rejection::JsonRejection;

use crate::error::ApiError;
use crate::protocol::{PROTOCOL_HEADER, check_version};

fn protocol_version(headers: &http::HeaderMap) -> Option<&str> {
    headers.get(PROTOCOL_HEADER).and_then(|v| v.to_str().ok())
}

/// `Json<T>` that rejects with an [`ApiError`] (400 `{error}`) instead of
/// axum's plain-text rejection, and refuses mismatched protocol versions.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        check_version(protocol_version(req.headers()))
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
        Ok(ApiJson(value))
    }
}
