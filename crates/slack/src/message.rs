//! Turns a release event into a Slack message.
//!
//! Each optional stage is a plain function so it can be switched off through
//! [`MessageConfig`] and tested on its own.

use std::{borrow::Cow, sync::OnceLock};

use regex::{Captures, Regex};
use release_bot_core::config::MessageConfig;
use release_bot_github::{ReleaseEvent, User};

use crate::{Attachment, Field, Message};

pub const TAG_FIELD: &str = "Tag";
pub const BUILD_FIELD: &str = "CircleCI";

pub struct MessageBuilder<'a> {
    config: &'a MessageConfig,
    username: &'a str,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(config: &'a MessageConfig, username: &'a str) -> Self { Self { config, username } }

    /// Builds the message for `channel`. `color` overrides the configured
    /// default; the build field is only added when `build_url` is known.
    pub fn build(
        &self,
        event: &ReleaseEvent,
        channel: &str,
        color: Option<&str>,
        build_url: Option<&str>,
    ) -> Message {
        let release = &event.release;
        let user = credited_user(event, self.config.author_fallback);
        let body = release.body.as_deref().unwrap_or_default();
        let text = if self.config.link_references {
            link_references(body, &event.repository.full_name)
        } else {
            Cow::Borrowed(body)
        };
        let mut fields = vec![Field::new(TAG_FIELD, release_url(event))];
        if let Some(build_url) = build_url {
            fields.push(Field::new(BUILD_FIELD, build_url));
        }
        let attachment = Attachment {
            title: Some(
                release
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| release.tag_name.clone()),
            ),
            title_link: release.html_url.clone(),
            author_name: user.map(|u| u.login.clone()),
            author_icon: user.and_then(|u| u.avatar_url.clone()),
            author_link: user.and_then(|u| u.html_url.clone()),
            text: (!text.is_empty()).then(|| text.into_owned()),
            color: Some(normalize_color(color.unwrap_or(&self.config.default_color))),
            ts: release.published_at.map(|t| t.unix_timestamp()),
            fields,
        };
        Message {
            channel: channel.to_string(),
            text: headline(event),
            username: self.username.to_string(),
            attachments: vec![attachment],
        }
    }
}

pub fn headline(event: &ReleaseEvent) -> String {
    format!(
        ":ship: New release for [*<{}|{}>*] `{}`",
        event.repository.url(),
        event.repository.display_name(),
        event.release.tag_name
    )
}

/// The user shown as the release author.
///
/// With `fallback`, a release authored by a bot (or with no author at all) is
/// credited to the user who triggered the event.
pub fn credited_user(event: &ReleaseEvent, fallback: bool) -> Option<&User> {
    let author = event.release.author.as_ref();
    if !fallback {
        return author;
    }
    match (author, event.sender.as_ref()) {
        (Some(author), Some(sender)) if author.is_bot() => Some(sender),
        (None, sender) => sender,
        (author, _) => author,
    }
}

/// Rewrites `#123` into a Slack link to the issue or pull request.
pub fn link_references<'a>(body: &'a str, full_name: &str) -> Cow<'a, str> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"(^|[^\w/&#])#(\d+)\b").unwrap());
    regex.replace_all(body, |caps: &Captures| {
        format!("{}<https://github.com/{}/issues/{}|#{}>", &caps[1], full_name, &caps[2], &caps[2])
    })
}

/// Accepts Slack color names as-is and adds the `#` a bare hex value is missing.
pub fn normalize_color(color: &str) -> String {
    let is_hex = matches!(color.len(), 3 | 6) && color.chars().all(|c| c.is_ascii_hexdigit());
    if is_hex { format!("#{color}") } else { color.to_string() }
}

fn release_url(event: &ReleaseEvent) -> String {
    match &event.release.html_url {
        Some(url) if !url.is_empty() => url.clone(),
        _ => format!("{}/releases/tag/{}", event.repository.url(), event.release.tag_name),
    }
}
