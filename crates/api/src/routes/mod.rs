mod assets;
mod sessions;
mod stream;
mod trading;

use axum::{middleware, Router};

use crate::{require_token, AppState};

/// Assemble the full route tree.
///
/// Everything under `/api` and `/ws` sits behind the shared dashboard
/// credential guard; the health probe stays open for deploy checks, and
/// any path nothing else claims falls through to the embedded dashboard
/// assets.
pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .merge(sessions::router())
        .merge(trading::router())
        .merge(stream::router())
        .route_layer(middleware::from_fn_with_state(state, require_token));

    Router::new()
        .merge(protected)
        .merge(trading::health_router())
        .fallback(assets::serve)
}
