use std::{fmt, sync::Arc};

use regex::Regex;

use crate::{directory::Directory, message::Message};

pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Clone, Debug)]
enum TextMatcher {
    Any,
    Literal(String),
    Pattern(Regex),
}

/// Decides whether a message is meant for a handler.
///
/// Channel and user scopes hold references (`#general`, `@alice`, raw ids)
/// and are resolved against the directory at match time, so a selector
/// built before the handshake starts matching once the snapshot lands.
#[derive(Clone, Debug)]
pub struct Selector {
    text: TextMatcher,
    channel: Option<String>,
    user: Option<String>,
    addressed_only: bool,
}

impl Selector {
    pub fn any() -> Self {
        Self { text: TextMatcher::Any, channel: None, user: None, addressed_only: false }
    }

    /// Case-insensitive literal match anywhere in the message body.
    pub fn text(literal: &str) -> Self {
        Self { text: TextMatcher::Literal(literal.to_lowercase()), ..Self::any() }
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(pattern)?;
        Ok(Self { text: TextMatcher::Pattern(pattern), ..Self::any() })
    }

    pub fn in_channel(mut self, reference: impl Into<String>) -> Self {
        self.channel = Some(reference.into());
        self
    }

    pub fn from_user(mut self, reference: impl Into<String>) -> Self {
        self.user = Some(reference.into());
        self
    }

    pub fn addressed(mut self) -> Self {
        self.addressed_only = true;
        self
    }

    pub fn matches(&self, message: &Message, directory: &Directory) -> bool {
        if self.addressed_only && !message.is_addressed() {
            return false;
        }

        if let Some(reference) = &self.channel {
            let Some(expected) = directory.channel_or_im_data(reference) else {
                return false;
            };
            if message.channel_id() != Some(expected.id()) {
                return false;
            }
        }

        if let Some(reference) = &self.user {
            let Some(expected) = directory.user_data(reference) else {
                return false;
            };
            if message.user_id() != Some(expected.id.as_str()) {
                return false;
            }
        }

        match &self.text {
            TextMatcher::Any => true,
            TextMatcher::Literal(literal) => message.body().to_lowercase().contains(literal),
            TextMatcher::Pattern(pattern) => pattern.is_match(message.body()),
        }
    }
}

/// A registered (selector, callback) pair.
#[derive(Clone)]
pub struct Handler {
    selector: Selector,
    callback: MessageCallback,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("selector", &self.selector).finish_non_exhaustive()
    }
}

impl Handler {
    pub fn new<F>(selector: Selector, callback: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Self { selector, callback: Arc::new(callback) }
    }

    pub fn from_callback(selector: Selector, callback: MessageCallback) -> Self {
        Self { selector, callback }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Invokes the callback when the selector applies; returns whether it did.
    pub fn matches(&self, message: &Message, directory: &Directory) -> bool {
        if !self.selector.matches(message, directory) {
            return false;
        }
        (self.callback)(message);
        true
    }
}
