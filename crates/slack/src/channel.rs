use std::sync::{Mutex, PoisonError};

use crate::{directory::Directory, format::OutboundMessage};

/// A named destination whose id follows the current directory snapshot.
#[derive(Debug)]
pub struct ChannelRef {
    name: String,
    id: Mutex<Option<String>>,
}

impl ChannelRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), id: Mutex::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<String> {
        self.id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Re-resolves the id against a freshly applied snapshot.
    pub fn set_channels(&self, directory: &Directory) {
        let resolved =
            directory.channel_or_im_data(&self.name).map(|conversation| conversation.id().to_owned());
        *self.id.lock().unwrap_or_else(PoisonError::into_inner) = resolved;
    }

    /// Addresses the resolved id when known and the raw name otherwise.
    pub fn message(&self, text: impl Into<String>) -> OutboundMessage {
        let destination = self.id().unwrap_or_else(|| self.name.clone());
        OutboundMessage::new(destination, text)
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelRef;
    use crate::directory::{fixture_snapshot, Directory};

    #[test]
    fn id_follows_applied_directory() {
        let channel = ChannelRef::new("#general");
        assert_eq!(channel.id(), None);
        assert_eq!(channel.message("hi").channel.as_deref(), Some("#general"));

        channel.set_channels(&Directory::new(fixture_snapshot()));
        assert_eq!(channel.id().as_deref(), Some("C1"));
        assert_eq!(channel.message("hi").channel.as_deref(), Some("C1"));

        channel.set_channels(&Directory::empty());
        assert_eq!(channel.id(), None);
    }
}
