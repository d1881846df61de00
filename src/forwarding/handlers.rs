use super::protocol::{ENDPOINT_STATS, Response};
use crate::supervisor::{Supervisor, SupervisorStats};

use axum::body::Bytes;
use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

/// Routes of the node's RPC server.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/rpc/:method", post(handle_rpc))
        .route(ENDPOINT_STATS, get(handle_stats))
        .layer(Extension(supervisor))
}

/// Entry point of forwarded calls.
///
/// 400 when the method is unknown or the body cannot be decoded, 500 when the
/// supervisor failed the call, 200 otherwise. The body is always a `Response`.
pub async fn handle_rpc(
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Path(method): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<Response>) {
    let request = match supervisor.decode_request(&method, &body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected {} call: {}", method, e);
            return (
                StatusCode::BAD_REQUEST,
                Json(Response::failure(supervisor.node(), e)),
            );
        }
    };

    let response = supervisor.serve_request(request).await;
    if response.is_success() {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(response))
    }
}

pub async fn handle_stats(
    Extension(supervisor): Extension<Arc<Supervisor>>,
) -> (StatusCode, Json<SupervisorStats>) {
    (StatusCode::OK, Json(supervisor.stats()))
}
