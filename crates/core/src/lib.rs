pub mod config;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Body returned whenever a request could not be handled.
pub const FAILURE_BODY: &str = "Unable to handle request";

/// Handler error. Logged with its full context, answered with a bare 500.
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("{:?}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self { Self(err.into()) }
}
