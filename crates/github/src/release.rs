//! Typed `release` webhook payload and the gate deciding whether it is announced.
//!
//! Only the fields the notification needs are modelled. Everything except the
//! release itself, its tag and the repository is optional, so partial payloads
//! still parse.

use std::fmt;

use serde::Deserialize;
use time::OffsetDateTime;

/// GitHub account type used by apps and other automation identities.
const BOT_TYPE: &str = "Bot";

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseEvent {
    #[serde(default)]
    pub action: String,
    pub release: Release,
    pub repository: Repository,
    #[serde(default)]
    pub sender: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl User {
    pub fn is_bot(&self) -> bool {
        self.kind.as_deref() == Some(BOT_TYPE) || self.login.ends_with("[bot]")
    }
}

impl Repository {
    /// Splits `full_name` into `(owner, repo)`.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        let (owner, repo) = self.full_name.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some((owner, repo))
    }

    /// Short repository name, derived from `full_name` when the payload omits it.
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ => self.owner_and_name().map_or(self.full_name.as_str(), |(_, repo)| repo),
        }
    }

    pub fn url(&self) -> String {
        match &self.html_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("https://github.com/{}", self.full_name),
        }
    }
}

/// Why a release event is not announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    Action(String),
    Draft,
    Prerelease,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(action) => write!(f, "action '{action}' is not announced"),
            Self::Draft => f.write_str("release is a draft"),
            Self::Prerelease => f.write_str("release is a prerelease"),
        }
    }
}

impl ReleaseEvent {
    /// Accepts the event when its action is listed in `actions` and the release
    /// is neither a draft nor a prerelease. An empty `actions` list accepts any action.
    pub fn check(&self, actions: &[String]) -> Result<(), Skip> {
        if !actions.is_empty() && !actions.iter().any(|a| a == &self.action) {
            return Err(Skip::Action(self.action.clone()));
        }
        if self.release.draft {
            return Err(Skip::Draft);
        }
        if self.release.prerelease {
            return Err(Skip::Prerelease);
        }
        Ok(())
    }
}
