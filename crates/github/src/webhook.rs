use std::{fmt::Display, sync::Arc};

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use release_bot_core::{FAILURE_BODY, config::Config};
use sha2::Sha256;

use crate::release::ReleaseEvent;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const RELEASE_EVENT: &str = "release";

/// Verify and extract a GitHub webhook delivery.
///
/// Only `release` bodies are parsed; any other event type (including a missing
/// `X-GitHub-Event` header) is passed through by name so the handler can
/// acknowledge it without work.
#[must_use]
pub enum GitHubEvent {
    Release(Box<ReleaseEvent>),
    Other(String),
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let kind = req
            .headers()
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let config = <Arc<Config>>::from_ref(state);
        let body = if let Some(secret) =
            config.github.webhook_secret.as_deref().filter(|s| !s.is_empty())
        {
            let signature_sha256 = req
                .headers()
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| err("X-Hub-Signature-256 missing"))?
                .strip_prefix("sha256=")
                .ok_or_else(|| err("X-Hub-Signature-256 sha256= prefix missing"))?;
            let signature =
                hex::decode(signature_sha256).map_err(|_| err("X-Hub-Signature-256 malformed"))?;
            let body =
                Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
            if !verify_signature(secret, &body, &signature) {
                return Err(err("signature mismatch"));
            }
            body
        } else {
            Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?
        };
        if kind != RELEASE_EVENT {
            return Ok(GitHubEvent::Other(kind));
        }
        match serde_json::from_slice::<ReleaseEvent>(&body) {
            Ok(event) => Ok(GitHubEvent::Release(Box::new(event))),
            Err(e) => {
                tracing::error!("Failed to parse release event: {e}");
                Err((StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY).into_response())
            }
        }
    }
}

fn mac(secret: &str, body: &[u8]) -> Hmac<Sha256> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac
}

pub fn verify_signature(secret: &str, body: &[u8], signature: &[u8]) -> bool {
    mac(secret, body).verify_slice(signature).is_ok()
}

/// Computes the `X-Hub-Signature-256` header value GitHub sends for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    format!("sha256={}", hex::encode(mac(secret, body).finalize().into_bytes()))
}
