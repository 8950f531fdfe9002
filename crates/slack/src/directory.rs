//! Directory snapshot and reference resolution.
//!
//! References come in three shapes: `#name` for channels, `@name` for users
//! (and, for conversations, their direct-message thread) and bare ids.
//! Every lookup against an empty directory returns `None`.

use std::sync::Arc;

use serde::Deserialize;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SelfIdentity {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ImRecord {
    pub id: String,
    pub user: String,
}

/// The handshake payload: bot identity, streaming endpoint and directory listings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "self")]
    pub identity: SelfIdentity,
    pub url: String,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub ims: Vec<ImRecord>,
}

/// A resolved conversation: either a named channel or a direct-message thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversation<'a> {
    Channel(&'a ChannelRecord),
    Im(&'a ImRecord),
}

impl<'a> Conversation<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            Self::Channel(channel) => &channel.id,
            Self::Im(im) => &im.id,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Directory {
    snapshot: Option<Arc<Snapshot>>,
}

impl Directory {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { snapshot: Some(Arc::new(snapshot)) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }

    pub fn identity(&self) -> Option<&SelfIdentity> {
        self.snapshot().map(|snapshot| &snapshot.identity)
    }

    pub fn channel_data(&self, reference: &str) -> Option<Conversation<'_>> {
        let snapshot = self.snapshot()?;

        if let Some(name) = reference.strip_prefix('#') {
            snapshot.channels.iter().find(|channel| channel.name == name).map(Conversation::Channel)
        } else if reference.starts_with('@') {
            self.im_data_for_user(reference).map(Conversation::Im)
        } else {
            snapshot
                .channels
                .iter()
                .find(|channel| channel.id == reference)
                .map(Conversation::Channel)
        }
    }

    /// `@name` is resolved to a user id first; anything else is taken as a user id.
    pub fn im_data_for_user(&self, reference: &str) -> Option<&ImRecord> {
        let snapshot = self.snapshot()?;

        let user_id = match reference.strip_prefix('@') {
            Some(name) => self.user_id(name)?,
            None => reference,
        };

        snapshot.ims.iter().find(|im| im.user == user_id)
    }

    pub fn im_data(&self, id: &str) -> Option<&ImRecord> {
        self.snapshot()?.ims.iter().find(|im| im.id == id)
    }

    pub fn user_id(&self, name: &str) -> Option<&str> {
        let snapshot = self.snapshot()?;
        snapshot.users.iter().find(|user| user.name == name).map(|user| user.id.as_str())
    }

    pub fn user_data(&self, reference: &str) -> Option<&UserRecord> {
        let snapshot = self.snapshot()?;

        match reference.strip_prefix('@') {
            Some(name) => snapshot.users.iter().find(|user| user.name == name),
            None => snapshot.users.iter().find(|user| user.id == reference),
        }
    }

    pub fn channel_or_im_data(&self, reference: &str) -> Option<Conversation<'_>> {
        self.channel_data(reference).or_else(|| self.im_data(reference).map(Conversation::Im))
    }
}

#[cfg(test)]
pub(crate) fn fixture_snapshot() -> Snapshot {
    Snapshot {
        identity: SelfIdentity { id: "UBOT".to_owned(), name: "chatterbox".to_owned() },
        url: "wss://stream.example.test/websocket/1".to_owned(),
        channels: vec![
            ChannelRecord { id: "C1".to_owned(), name: "general".to_owned() },
            ChannelRecord { id: "C2".to_owned(), name: "dev".to_owned() },
        ],
        users: vec![
            UserRecord { id: "U1".to_owned(), name: "alice".to_owned() },
            UserRecord { id: "U2".to_owned(), name: "bob".to_owned() },
        ],
        ims: vec![ImRecord { id: "D1".to_owned(), user: "U1".to_owned() }],
    }
}
