use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod release;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/release/{token}/{channel}", post(release::release))
}

async fn health() -> &'static str { "OK" }
