//! HTTP response handling shared by the store adapters.

use reqwest::{Response, StatusCode};
use setkeeper_reconcile::StoreError;

/// Map a transport failure. The request may or may not have been applied.
pub(crate) fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Map a body that did not decode as expected.
pub(crate) fn decode(err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(err.to_string())
}

/// Classify a non-success response by status code.
pub(crate) async fn status_error(what: &str, response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{what} failed (status={}): {}", status.as_u16(), body.trim());

    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => StoreError::Conflict(message),
        _ => StoreError::Unavailable(message),
    }
}
