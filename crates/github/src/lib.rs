//! GitHub side of the release bot: the webhook extractor and the typed
//! `release` payload it produces.

pub mod release;
pub mod webhook;

pub use release::{Release, ReleaseEvent, Repository, Skip, User};
pub use webhook::GitHubEvent;
