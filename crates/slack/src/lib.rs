pub mod message;

use anyhow::{Context, Result, bail};
use release_bot_core::config::SlackConfig;
use serde::{Deserialize, Serialize};
use url::Url;

pub use message::MessageBuilder;

const USER_AGENT: &str = concat!("release-bot/", env!("CARGO_PKG_VERSION"));

/// Body of a `chat.postMessage` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub channel: String,
    pub text: String,
    pub username: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub title: String,
    pub value: String,
    pub short: bool,
}

impl Field {
    pub fn new(title: impl Into<String>, value: impl Into<String>) -> Self {
        Self { title: title.into(), value: value.into(), short: false }
    }
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Slack {
    client: reqwest::Client,
    post_message_url: Url,
}

impl Slack {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        let mut post_message_url = Url::parse(&config.api_url).context("Invalid Slack API URL")?;
        post_message_url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("{} cannot be used as a base URL", config.api_url))?
            .pop_if_empty()
            .push("chat.postMessage");
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create Slack client")?;
        Ok(Self { client, post_message_url })
    }

    /// Posts `message` with the bot token `token`.
    pub async fn post_message(&self, token: &str, message: &Message) -> Result<()> {
        let response = self
            .client
            .post(self.post_message_url.clone())
            .bearer_auth(token)
            .json(message)
            .send()
            .await
            .context("Failed to send Slack message")?
            .error_for_status()
            .context("Slack rejected the message")?;
        let reply: ApiReply = response.json().await.context("Failed to parse Slack response")?;
        if !reply.ok {
            bail!("Slack API error: {}", reply.error.as_deref().unwrap_or("unknown"));
        }
        tracing::info!("Posted release message to channel {}", message.channel);
        Ok(())
    }
}
