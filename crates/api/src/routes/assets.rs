//! Embedded dashboard assets, compiled into the binary from the api
//! crate's own `assets/dashboard/` directory.

use axum::{
    body::Body,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use rust_embed::RustEmbed;
use serde_json::json;

/// The built dashboard bundle. The placeholder page ships by default;
/// a real build drops its hashed output into the same directory.
#[derive(RustEmbed)]
#[folder = "assets/dashboard/"]
struct Dashboard;

/// Catch-all for everything the API and WS routers did not claim.
///
/// Unknown `/api` and `/ws` paths stay JSON 404s (a typoed endpoint must
/// not come back as HTML); anything else resolves against the embedded
/// bundle, falling back to the index page so client-side routing works.
pub async fn serve(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');

    if path.starts_with("api/") || path.starts_with("ws/") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no such endpoint: /{path}") })),
        )
            .into_response();
    }

    let candidate = if path.is_empty() { "index.html" } else { path };
    if let Some(asset) = Dashboard::get(candidate) {
        return bundle_response(candidate, asset.data.into_owned());
    }

    match Dashboard::get("index.html") {
        Some(index) => bundle_response("index.html", index.data.into_owned()),
        None => (StatusCode::NOT_FOUND, "dashboard bundle missing").into_response(),
    }
}

fn bundle_response(path: &str, data: Vec<u8>) -> Response {
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    // Hashed bundle files are immutable; the HTML entry point is not.
    let cache_control = if path.ends_with(".html") {
        "no-cache"
    } else {
        "public, max-age=31536000, immutable"
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(data))
        .unwrap()
}
