use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "RELEASE_BOT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";
/// Environment variable supplying the CircleCI token when the config file doesn't.
pub const CIRCLECI_TOKEN_VAR: &str = "CIRCLECI_TOKEN";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub circleci: CircleCiConfig,
    pub slack: SlackConfig,
    pub message: MessageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self { Self { port: 8080, request_timeout_secs: 60 } }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// When set, every webhook must carry a valid `X-Hub-Signature-256`.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircleCiConfig {
    /// Build lookup is disabled when no token is configured.
    pub token: Option<String>,
    pub api_url: String,
    pub app_url: String,
    /// Maximum number of build list requests per release.
    pub attempts: u32,
    /// Attempt `i` is followed by a sleep of `i * backoff_ms`.
    pub backoff_ms: u64,
    pub timeout_secs: u64,
    /// Upper bound on the whole lookup, retries included. Past it the release
    /// is announced without a build link.
    pub lookup_budget_ms: u64,
}

impl Default for CircleCiConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://circleci.com/api/v1.1".to_string(),
            app_url: "https://circleci.com".to_string(),
            attempts: 3,
            backoff_ms: 1000,
            timeout_secs: 30,
            lookup_budget_ms: 20_000,
        }
    }
}

impl CircleCiConfig {
    pub fn backoff(&self) -> Duration { Duration::from_millis(self.backoff_ms) }

    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }

    pub fn lookup_budget(&self) -> Duration { Duration::from_millis(self.lookup_budget_ms) }

    /// The configured token, treating an empty string as absent.
    pub fn token(&self) -> &str { self.token.as_deref().unwrap_or_default() }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SlackConfig {
    pub api_url: String,
    /// Display name used for the bot identity.
    pub username: String,
    pub timeout_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            api_url: "https://slack.com/api".to_string(),
            username: "Release Bot".to_string(),
            timeout_secs: 30,
        }
    }
}

impl SlackConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Release actions that produce a notification.
    pub actions: Vec<String>,
    /// Attachment color used when the request doesn't pick one.
    pub default_color: String,
    /// Credit the user who triggered the release when the author is a bot.
    pub author_fallback: bool,
    /// Rewrite `#123` references in the release body into links.
    pub link_references: bool,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            actions: vec!["published".to_string()],
            default_color: "#4286f4".to_string(),
            author_fallback: true,
            link_references: true,
        }
    }
}

impl Config {
    /// Loads the config file named by [`CONFIG_PATH_VAR`] (or [`DEFAULT_CONFIG_PATH`]),
    /// then applies environment fallbacks.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = Self::from_path(&path)?
            .with_token_fallback(std::env::var(CIRCLECI_TOKEN_VAR).ok());
        config.validate()?;
        Ok(config)
    }

    /// Checks that a release can be looked up and delivered before the
    /// request timeout cuts it off.
    pub fn validate(&self) -> Result<()> {
        let budget = self.circleci.lookup_budget();
        let deadline = self.server.request_timeout();
        ensure!(!budget.is_zero(), "circleci.lookup_budget_ms must be greater than zero");
        ensure!(
            budget + self.slack.timeout() < deadline,
            "circleci.lookup_budget_ms ({}ms) plus slack.timeout_secs ({}s) must stay below \
             server.request_timeout_secs ({}s)",
            budget.as_millis(),
            self.slack.timeout_secs,
            deadline.as_secs()
        );
        Ok(())
    }

    /// A missing file yields the default config.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => serde_yaml::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to open config file {}", path.display()))
            }
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse config")
    }

    /// Uses `token` for CircleCI when the config has none of its own.
    pub fn with_token_fallback(mut self, token: Option<String>) -> Self {
        if self.circleci.token().is_empty() {
            self.circleci.token = token.filter(|t| !t.is_empty());
        }
        self
    }
}
