use std::{fmt, time::Duration};

use release_bot_core::config::CircleCiConfig;
use tokio::time::{sleep, timeout};

use crate::{BuildQuery, BuildRecord, BuildSource, FetchError};

/// How often the build list is polled and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Always at least 1.
    pub attempts: u32,
    /// Attempt `i` (1-based) is followed by a sleep of `i * backoff`.
    pub backoff: Duration,
    /// Deadline for the whole lookup.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, backoff: Duration::from_secs(1), budget: Duration::from_secs(20) }
    }
}

impl From<&CircleCiConfig> for RetryPolicy {
    fn from(config: &CircleCiConfig) -> Self {
        Self::new(config.attempts, config.backoff(), config.lookup_budget())
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration, budget: Duration) -> Self {
        Self { attempts: attempts.max(1), backoff, budget }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration { self.backoff.saturating_mul(attempt) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found { url: String },
    NotFound,
}

impl Resolution {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Found { url } => Some(url),
            Self::NotFound => None,
        }
    }

    pub fn into_url(self) -> Option<String> {
        match self {
            Self::Found { url } => Some(url),
            Self::NotFound => None,
        }
    }
}

/// Why a resolution ended the way it did. Only used for diagnostics; callers
/// see a plain [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionReason {
    /// No token configured.
    Disabled,
    /// The release has no tag to look for.
    MissingTag,
    Matched { attempt: u32 },
    Exhausted { attempts: u32 },
    Transport,
    Malformed,
    /// The lookup budget ran out first.
    TimedOut,
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::MissingTag => f.write_str("missing tag"),
            Self::Matched { attempt } => write!(f, "matched on attempt {attempt}"),
            Self::Exhausted { attempts } => write!(f, "no match after {attempts} attempts"),
            Self::Transport => f.write_str("transport error"),
            Self::Malformed => f.write_str("malformed response"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

impl From<&FetchError> for ResolutionReason {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Transport(_) => Self::Transport,
            FetchError::Malformed(_) => Self::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub resolution: Resolution,
    pub reason: ResolutionReason,
}

impl Outcome {
    fn not_found(reason: ResolutionReason) -> Self {
        Self { resolution: Resolution::NotFound, reason }
    }
}

/// Finds the CI build for a release tag.
///
/// The build list can lag behind the tag push that triggered the release, so an
/// empty or non-matching list is retried up to [`RetryPolicy::attempts`] times.
/// Transport and parse failures are not retried, and the whole lookup is bounded
/// by [`RetryPolicy::budget`]. Nothing is ever surfaced as an error: every
/// failure ends in [`Resolution::NotFound`].
pub struct BuildResolver<S> {
    source: S,
    token: String,
    policy: RetryPolicy,
}

impl<S: BuildSource + Sync> BuildResolver<S> {
    pub fn new(source: S, token: impl Into<String>, policy: RetryPolicy) -> Self {
        let policy = RetryPolicy::new(policy.attempts, policy.backoff, policy.budget);
        Self { source, token: token.into(), policy }
    }

    pub fn is_enabled(&self) -> bool { !self.token.is_empty() }

    pub fn policy(&self) -> RetryPolicy { self.policy }

    pub async fn resolve(&self, account: &str, repo: &str, tag: &str) -> Resolution {
        self.resolve_with_reason(account, repo, tag).await.resolution
    }

    pub async fn resolve_with_reason(&self, account: &str, repo: &str, tag: &str) -> Outcome {
        if !self.is_enabled() {
            tracing::debug!("CircleCI lookup disabled, no token configured");
            return Outcome::not_found(ResolutionReason::Disabled);
        }
        if tag.is_empty() {
            return Outcome::not_found(ResolutionReason::MissingTag);
        }
        let budget = self.policy.budget;
        match timeout(budget, self.poll(account, repo, tag)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    "CircleCI lookup for {}/{} {} gave up after {}ms",
                    account,
                    repo,
                    tag,
                    budget.as_millis()
                );
                Outcome::not_found(ResolutionReason::TimedOut)
            }
        }
    }

    async fn poll(&self, account: &str, repo: &str, tag: &str) -> Outcome {
        let query = BuildQuery { token: &self.token, account, repo };
        let attempts = self.policy.attempts;
        for attempt in 1..=attempts {
            let builds = match self.source.list_builds(&query).await {
                Ok(builds) => builds,
                Err(e) => {
                    tracing::warn!(
                        "Failed to list CircleCI builds for {}/{}: {}",
                        account,
                        repo,
                        e
                    );
                    return Outcome::not_found(ResolutionReason::from(&e));
                }
            };
            if let Some(workflow_id) = find_workflow(&builds, tag) {
                let url = self.source.workflow_url(workflow_id);
                tracing::info!(
                    "Found CircleCI workflow {} for {}/{} {} (attempt {}/{})",
                    workflow_id,
                    account,
                    repo,
                    tag,
                    attempt,
                    attempts
                );
                return Outcome {
                    resolution: Resolution::Found { url },
                    reason: ResolutionReason::Matched { attempt },
                };
            }
            if attempt < attempts {
                tracing::info!(
                    "No CircleCI build for {}/{} {} yet, retrying (attempt {}/{})",
                    account,
                    repo,
                    tag,
                    attempt,
                    attempts
                );
                sleep(self.policy.delay_after(attempt)).await;
            }
        }
        tracing::warn!(
            "No CircleCI build for {}/{} {} after {} attempts",
            account,
            repo,
            tag,
            attempts
        );
        Outcome::not_found(ResolutionReason::Exhausted { attempts })
    }
}

/// First build in list order tagged exactly `tag` that has a workflow.
pub fn find_workflow<'a>(builds: &'a [BuildRecord], tag: &str) -> Option<&'a str> {
    builds.iter().filter(|b| b.source_tag == tag).find_map(|b| b.workflow_id.as_deref())
}
