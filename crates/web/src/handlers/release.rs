use anyhow::Context;
use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use release_bot_core::AppError;
use release_bot_github::GitHubEvent;
use release_bot_slack::MessageBuilder;
use serde::Deserialize;

use crate::AppState;

#[derive(Deserialize)]
pub struct ReleaseParams {
    color: Option<String>,
}

fn done() -> Response { Json(serde_json::json!({ "done": true })).into_response() }

/// Announces a published release in `channel`, linking the CircleCI workflow
/// when one can be found for the tag.
pub async fn release(
    State(state): State<AppState>,
    Path((token, channel)): Path<(String, String)>,
    Query(params): Query<ReleaseParams>,
    event: GitHubEvent,
) -> Result<Response, AppError> {
    let event = match event {
        GitHubEvent::Release(event) => event,
        GitHubEvent::Other(kind) => {
            tracing::debug!("Ignoring event '{}'", kind);
            return Ok(done());
        }
    };
    let config = &state.config;
    let repository = &event.repository.full_name;
    let tag = &event.release.tag_name;
    if let Err(skip) = event.check(&config.message.actions) {
        tracing::info!("Skipping release {} {}: {}", repository, tag, skip);
        return Ok(done());
    }
    tracing::info!("Received release {} {}", repository, tag);

    let build_url = match event.repository.owner_and_name() {
        Some((account, repo)) => {
            let outcome = state.resolver.resolve_with_reason(account, repo, tag).await;
            tracing::info!("CircleCI lookup for {} {}: {}", repository, tag, outcome.reason);
            outcome.resolution.into_url()
        }
        None => {
            tracing::warn!("Cannot look up builds for malformed repository '{}'", repository);
            None
        }
    };

    let message = MessageBuilder::new(&config.message, &config.slack.username).build(
        &event,
        &channel,
        params.color.as_deref().filter(|c| !c.is_empty()),
        build_url.as_deref(),
    );
    state
        .slack
        .post_message(&token, &message)
        .await
        .with_context(|| format!("Failed to announce release {repository} {tag}"))?;
    Ok(done())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use axum::{
        Router,
        body::{Body, to_bytes},
        extract::State,
        http::{Request, StatusCode},
        routing::{get, post},
    };
    use release_bot_core::{FAILURE_BODY, config::Config};
    use release_bot_github::webhook::sign;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::{AppState, app};

    const URI: &str = "/release/xoxb-1/C123";
    const BUILDS: &str = r#"[
        { "vcs_tag": "", "workflows": { "workflow_id": "w1" } },
        { "vcs_tag": "v1.0.0", "workflows": { "workflow_id": "w9" } }
    ]"#;

    #[derive(Clone, Default)]
    struct Upstream {
        ci_hits: Arc<AtomicU32>,
        ci_delay: Duration,
        messages: Arc<Mutex<Vec<Value>>>,
    }

    impl Upstream {
        fn ci_hits(&self) -> u32 { self.ci_hits.load(Ordering::SeqCst) }

        fn messages(&self) -> Vec<Value> { self.messages.lock().unwrap().clone() }
    }

    async fn list_builds(State(upstream): State<Upstream>) -> &'static str {
        upstream.ci_hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(upstream.ci_delay).await;
        BUILDS
    }

    async fn post_message(
        State(upstream): State<Upstream>,
        axum::Json(body): axum::Json<Value>,
    ) -> axum::Json<Value> {
        let ok = body["channel"] != "C-fail";
        upstream.messages.lock().unwrap().push(body);
        axum::Json(if ok { json!({ "ok": true }) } else { json!({ "ok": false, "error": "boom" }) })
    }

    /// Starts `upstream` and returns a config pointing at it.
    async fn serve(upstream: &Upstream) -> Config {
        let router = Router::new()
            .route("/circleci/project/github/{account}/{repo}", get(list_builds))
            .route("/slack/chat.postMessage", post(post_message))
            .with_state(upstream.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let mut config = Config::default();
        config.circleci.api_url = format!("http://{addr}/circleci");
        config.circleci.backoff_ms = 0;
        config.slack.api_url = format!("http://{addr}/slack");
        config
    }

    async fn state(token: Option<&str>, secret: Option<&str>) -> (AppState, Upstream) {
        let upstream = Upstream::default();
        let mut config = serve(&upstream).await;
        config.github.webhook_secret = secret.map(str::to_string);
        config.circleci.token = token.map(str::to_string);
        (AppState::new(config).unwrap(), upstream)
    }

    fn release_body(tag: &str, draft: bool) -> String {
        json!({
            "action": "published",
            "release": {
                "tag_name": tag,
                "name": "Widget",
                "body": "Fixes #3",
                "draft": draft,
                "author": { "login": "hubot", "type": "User" }
            },
            "repository": {
                "full_name": "acme/widget",
                "name": "widget",
                "html_url": "https://github.com/acme/widget"
            }
        })
        .to_string()
    }

    async fn send(
        state: AppState,
        uri: &str,
        event: Option<&str>,
        signature: Option<String>,
        body: String,
    ) -> (StatusCode, String) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("X-GitHub-Delivery", "d-1");
        if let Some(event) = event {
            request = request.header("X-GitHub-Event", event);
        }
        if let Some(signature) = signature {
            request = request.header("X-Hub-Signature-256", signature);
        }
        let response = app(state).oneshot(request.body(Body::from(body)).unwrap()).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn fields(message: &Value) -> Vec<(String, String)> {
        message["attachments"][0]["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| {
                (f["title"].as_str().unwrap().to_string(), f["value"].as_str().unwrap().to_string())
            })
            .collect()
    }

    #[tokio::test]
    async fn announces_release_with_build_link() {
        let (state, upstream) = state(Some("abc"), None).await;
        let (status, body) =
            send(state, URI, Some("release"), None, release_body("v1.0.0", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "done": true }));
        assert_eq!(upstream.ci_hits(), 1);
        let messages = upstream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["channel"], "C123");
        assert_eq!(
            messages[0]["text"],
            ":ship: New release for [*<https://github.com/acme/widget|widget>*] `v1.0.0`"
        );
        assert_eq!(messages[0]["attachments"][0]["color"], "#4286f4");
        let fields = fields(&messages[0]);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, "Tag");
        assert_eq!(fields[1].0, "CircleCI");
        assert!(fields[1].1.ends_with("w9"));
    }

    #[tokio::test]
    async fn unmatched_tag_is_announced_without_build_link() {
        let (state, upstream) = state(Some("abc"), None).await;
        let (status, _) =
            send(state, URI, Some("release"), None, release_body("v2.0.0", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upstream.ci_hits(), 3);
        let messages = upstream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(fields(&messages[0]).len(), 1);
    }

    #[tokio::test]
    async fn missing_token_skips_lookup() {
        let (state, upstream) = state(None, None).await;
        let (status, _) =
            send(state, URI, Some("release"), None, release_body("v1.0.0", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upstream.ci_hits(), 0);
        assert_eq!(fields(&upstream.messages()[0]).len(), 1);
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let (state, upstream) = state(Some("abc"), None).await;
        let (status, body) = send(state.clone(), URI, Some("push"), None, "{}".to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "done": true }));
        let (status, _) = send(state, URI, None, None, release_body("v1.0.0", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upstream.ci_hits(), 0);
        assert!(upstream.messages().is_empty());
    }

    #[tokio::test]
    async fn drafts_are_ignored() {
        let (state, upstream) = state(Some("abc"), None).await;
        let (status, _) =
            send(state, URI, Some("release"), None, release_body("v1.0.0", true)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upstream.ci_hits(), 0);
        assert!(upstream.messages().is_empty());
    }

    #[tokio::test]
    async fn malformed_release_fails() {
        let (state, upstream) = state(Some("abc"), None).await;
        let (status, body) = send(state, URI, Some("release"), None, "{".to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, FAILURE_BODY);
        assert!(upstream.messages().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_fails() {
        let (state, upstream) = state(Some("abc"), None).await;
        let (status, body) = send(
            state,
            "/release/xoxb-1/C-fail",
            Some("release"),
            None,
            release_body("v1.0.0", false),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, FAILURE_BODY);
        assert_eq!(upstream.messages().len(), 1);
    }

    #[tokio::test]
    async fn color_query_is_applied() {
        let (state, upstream) = state(None, None).await;
        let (status, _) = send(
            state,
            "/release/xoxb-1/C123?color=ff0000",
            Some("release"),
            None,
            release_body("v1.0.0", false),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upstream.messages()[0]["attachments"][0]["color"], "#ff0000");
    }

    #[tokio::test]
    async fn signed_deliveries() {
        let (state, upstream) = state(None, Some("s3cret")).await;
        let body = release_body("v1.0.0", false);
        let (status, _) = send(
            state.clone(),
            URI,
            Some("release"),
            Some(sign("s3cret", body.as_bytes())),
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            send(state, URI, Some("release"), Some(sign("other", body.as_bytes())), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(upstream.messages().len(), 1);
    }

    #[tokio::test]
    async fn slow_lookup_still_announces() {
        let upstream = Upstream { ci_delay: Duration::from_millis(600), ..Default::default() };
        let mut config = serve(&upstream).await;
        config.circleci.token = Some("abc".to_string());
        config.circleci.lookup_budget_ms = 300;
        config.slack.timeout_secs = 1;
        config.server.request_timeout_secs = 2;
        let state = AppState::new(config).unwrap();
        let (status, body) =
            send(state, URI, Some("release"), None, release_body("v1.0.0", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "done": true }));
        assert_eq!(upstream.ci_hits(), 1);
        let messages = upstream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(fields(&messages[0]).len(), 1);
    }

    #[test]
    fn rejects_budget_beyond_request_timeout() {
        let mut config = Config::default();
        config.circleci.lookup_budget_ms = 60_000;
        assert!(AppState::new(config).is_err());
    }

    #[tokio::test]
    async fn health() {
        let (state, _) = state(None, None).await;
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
