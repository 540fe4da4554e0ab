//! CircleCI build lookup.
//!
//! [`CircleCi`] lists a project's recent builds over the v1.1 API and
//! [`BuildResolver`] polls it until a build for a given tag shows up.

pub mod resolver;

use std::future::Future;

use anyhow::{Context, Result, bail};
use release_bot_core::config::CircleCiConfig;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub use resolver::{BuildResolver, Outcome, Resolution, ResolutionReason, RetryPolicy};

const USER_AGENT: &str = concat!("release-bot/", env!("CARGO_PKG_VERSION"));

/// One entry of the project build list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawBuild")]
pub struct BuildRecord {
    /// Tag the build ran against; empty when it wasn't tag-triggered.
    pub source_tag: String,
    pub workflow_id: Option<String>,
}

#[derive(Deserialize)]
struct RawBuild {
    #[serde(default)]
    vcs_tag: Option<String>,
    #[serde(default)]
    workflows: Option<RawWorkflows>,
}

#[derive(Deserialize)]
struct RawWorkflows {
    #[serde(default)]
    workflow_id: Option<String>,
}

impl From<RawBuild> for BuildRecord {
    fn from(value: RawBuild) -> Self {
        Self {
            source_tag: value.vcs_tag.unwrap_or_default(),
            workflow_id: value.workflows.and_then(|w| w.workflow_id).filter(|id| !id.is_empty()),
        }
    }
}

/// Identifies the project whose builds are listed.
#[derive(Debug, Clone, Copy)]
pub struct BuildQuery<'a> {
    pub token: &'a str,
    pub account: &'a str,
    pub repo: &'a str,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection failure, timeout or a non-success status.
    #[error("build list request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response body isn't a build list.
    #[error("malformed build list: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Source of build records for a project.
pub trait BuildSource {
    fn list_builds(
        &self,
        query: &BuildQuery<'_>,
    ) -> impl Future<Output = Result<Vec<BuildRecord>, FetchError>> + Send;

    /// Link to the page showing a workflow run.
    fn workflow_url(&self, workflow_id: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct CircleCi {
    client: reqwest::Client,
    api_url: Url,
    app_url: Url,
}

impl CircleCi {
    pub fn new(config: &CircleCiConfig) -> Result<Self> {
        let api_url = parse_base_url(&config.api_url).context("Invalid CircleCI API URL")?;
        let app_url = parse_base_url(&config.app_url).context("Invalid CircleCI app URL")?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create CircleCI client")?;
        Ok(Self { client, api_url, app_url })
    }

    fn project_url(&self, account: &str, repo: &str) -> Url {
        with_segments(&self.api_url, &["project", "github", account, repo])
    }
}

impl BuildSource for CircleCi {
    async fn list_builds(&self, query: &BuildQuery<'_>) -> Result<Vec<BuildRecord>, FetchError> {
        // The token rides in the query string; keep it out of error messages.
        let response = self
            .client
            .get(self.project_url(query.account, query.repo))
            .query(&[("circle-token", query.token)])
            .header(ACCEPT, "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.without_url())?;
        let body = response.bytes().await.map_err(|e| e.without_url())?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn workflow_url(&self, workflow_id: &str) -> String {
        with_segments(&self.app_url, &["workflow-run", workflow_id]).into()
    }
}

fn parse_base_url(value: &str) -> Result<Url> {
    let url = Url::parse(value)?;
    if url.cannot_be_a_base() {
        bail!("{value} cannot be used as a base URL");
    }
    Ok(url)
}

fn with_segments(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
