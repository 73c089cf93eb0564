//! /{ns}/{name}/_meta handler.

use axum::extract::Path;
use axum::http::header;
use axum::response::IntoResponse;

use super::JSON_CT;

pub async fn handle_meta(Path((ns, name)): Path<(String, String)>) -> impl IntoResponse {
    tracing::trace!(ns = %ns, name = %name, "meta");
    ([(header::CONTENT_TYPE, JSON_CT)], "{}\r\n")
}
