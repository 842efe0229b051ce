//! Request counting middleware.

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;

/// Counter incremented once per routed request.
pub const REQUESTS_TOTAL: &str = "auth_http_requests_total";

/// Records `auth_http_requests_total{method, path, status}`.
///
/// The path label is the route template (`/admin/users/{id}/deactivate`),
/// so user ids never become label values. Must be installed with
/// `route_layer` for the template to be available.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(REQUESTS_TOTAL, "method" => method, "path" => path, "status" => status)
        .increment(1);

    response
}
