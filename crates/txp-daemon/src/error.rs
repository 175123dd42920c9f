//! Mapping from the service error taxonomy to HTTP responses.
//!
//! Every refusal a handler surfaces travels as `anyhow::Error` carrying one
//! of the typed enums; this module downcasts in one place so the status-code
//! contract lives in exactly one table:
//!
//! | error                | code |
//! |----------------------|------|
//! | BadRequest           | 400  |
//! | Unauthenticated      | 401  |
//! | Forbidden            | 403  |
//! | NotFound             | 404  |
//! | PayloadTooLarge      | 413  |
//! | QuotaExceeded        | 429  |
//! | IllegalTransition    | 500  |
//! | UpstreamFailed       | 502  |
//! | Unavailable          | 503  |
//! | QueueFull            | 503  |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use txp_assembler::AssembleError;
use txp_auth::AuthError;
use txp_coordinator::EnqueueError;
use txp_pool::PoolError;

use crate::api_types::ErrorResponse;

pub(crate) fn bad_request(message: impl Into<String>) -> Response {
    respond(StatusCode::BAD_REQUEST, message.into())
}

pub(crate) fn not_found(message: impl Into<String>) -> Response {
    respond(StatusCode::NOT_FOUND, message.into())
}

pub(crate) fn upstream_failed(message: impl Into<String>) -> Response {
    respond(StatusCode::BAD_GATEWAY, message.into())
}

pub(crate) fn forbidden(message: impl Into<String>) -> Response {
    respond(StatusCode::FORBIDDEN, message.into())
}

/// Downcast a refusal to its taxonomy entry; unknown errors are 500 and
/// logged server-side, with the detail kept out of the response body.
pub(crate) fn refusal_response(err: anyhow::Error) -> Response {
    if let Some(auth) = err.downcast_ref::<AuthError>() {
        let code = match auth {
            AuthError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        };
        return respond(code, auth.to_string());
    }

    if let Some(pool) = err.downcast_ref::<PoolError>() {
        let code = match pool {
            PoolError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::IllegalTransition { .. } | PoolError::UnknownOutpoint(_) => {
                tracing::error!(error = %pool, "pool invariant violation surfaced to handler");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        return respond(code, pool.to_string());
    }

    if let Some(assemble) = err.downcast_ref::<AssembleError>() {
        let code = match assemble {
            AssembleError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        };
        return respond(code, assemble.to_string());
    }

    if let Some(enqueue) = err.downcast_ref::<EnqueueError>() {
        return respond(StatusCode::SERVICE_UNAVAILABLE, enqueue.to_string());
    }

    tracing::error!(error = %err, "unclassified handler error");
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error".to_string(),
    )
}

fn respond(code: StatusCode, error: String) -> Response {
    (code, Json(ErrorResponse { error })).into_response()
}
