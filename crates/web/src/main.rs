mod handlers;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, FromRef, MatchedPath},
    http::{HeaderName, Request, StatusCode, header},
};
use release_bot_circleci::{BuildResolver, CircleCi, RetryPolicy};
use release_bot_core::config::Config;
use release_bot_github::webhook::EVENT_HEADER;
use release_bot_slack::Slack;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    resolver: Arc<BuildResolver<CircleCi>>,
    slack: Arc<Slack>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid config")?;
        let circleci =
            CircleCi::new(&config.circleci).context("Failed to create CircleCI client")?;
        let resolver = BuildResolver::new(
            circleci,
            config.circleci.token(),
            RetryPolicy::from(&config.circleci),
        );
        let slack = Slack::new(&config.slack).context("Failed to create Slack client")?;
        Ok(Self { config: Arc::new(config), resolver: Arc::new(resolver), slack: Arc::new(slack) })
    }
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = Config::load().expect("Failed to load config");
    let port = config.server.port;
    let state = AppState::new(config).expect("Failed to create app state");
    if state.resolver.is_enabled() {
        let policy = state.resolver.policy();
        tracing::info!(
            "CircleCI lookup enabled ({} attempts, {}ms backoff, {}ms budget)",
            policy.attempts,
            policy.backoff.as_millis(),
            policy.budget.as_millis()
        );
    } else {
        tracing::info!("CircleCI lookup disabled: no token configured");
    }

    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server error")
    {
        tracing::error!("{e:?}");
    }
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> =
        vec![header::AUTHORIZATION, HeaderName::from_static("x-hub-signature-256")].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.server.request_timeout(),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash());
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Opens one span per request. The request path embeds the Slack token, so
/// only the matched route is recorded.
#[derive(Debug, Clone)]
pub struct RequestSpan {
    level: Level,
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let forwarded_for = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| IpAddr::from_str(s.trim()).ok());
        let ip = forwarded_for
            .or_else(|| {
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(socket_addr)| socket_addr.ip())
            })
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str)
            .unwrap_or("[unmatched]");
        let event = request
            .headers()
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[none]");
        let delivery = request
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[none]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    route = %route,
                    ip = %ip,
                    event = %event,
                    delivery = %delivery,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
