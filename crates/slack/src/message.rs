use serde::Deserialize;
use serde_json::{Map, Value};

pub const BOT_MESSAGE_SUBTYPE: &str = "bot_message";

/// A `message` event as delivered on the streaming leg.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundMessage {
    pub fn is_bot_message(&self) -> bool {
        self.subtype.as_deref() == Some(BOT_MESSAGE_SUBTYPE)
    }
}

/// Handler-facing view of an inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    raw: InboundMessage,
    addressed: bool,
    body: String,
}

impl Message {
    /// `bot_id` and `im_prefix` decide whether the message is addressed to the bot:
    /// a direct message, a leading `<@BOT>` mention or a leading prefix all count.
    pub fn new(raw: InboundMessage, bot_id: Option<&str>, im_prefix: Option<&str>) -> Self {
        let text = raw.text.as_deref().unwrap_or_default();
        let direct = raw.channel.as_deref().is_some_and(is_direct_channel);

        let stripped = bot_id
            .and_then(|id| strip_mention(text, id))
            .or_else(|| im_prefix.filter(|p| !p.is_empty()).and_then(|p| text.strip_prefix(p)));

        let (addressed, body) = match stripped {
            Some(rest) => (true, rest.trim_start_matches([':', ',']).trim().to_owned()),
            None => (direct, text.trim().to_owned()),
        };

        Self { raw, addressed, body }
    }

    pub fn raw(&self) -> &InboundMessage {
        &self.raw
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.raw.channel.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.raw.user.as_deref()
    }

    pub fn text(&self) -> &str {
        self.raw.text.as_deref().unwrap_or_default()
    }

    pub fn ts(&self) -> Option<&str> {
        self.raw.ts.as_deref()
    }

    pub fn is_direct(&self) -> bool {
        self.channel_id().is_some_and(is_direct_channel)
    }

    pub fn is_addressed(&self) -> bool {
        self.addressed
    }

    /// Text with any leading mention or prefix removed.
    pub fn body(&self) -> &str {
        &self.body
    }
}

fn is_direct_channel(channel_id: &str) -> bool {
    channel_id.starts_with('D')
}

fn strip_mention<'a>(text: &'a str, bot_id: &str) -> Option<&'a str> {
    let rest = text.trim_start().strip_prefix("<@")?;
    let rest = rest.strip_prefix(bot_id)?;
    // `<@U123|name>` is the labelled form of the same mention
    let close = rest.find('>')?;
    if close > 0 && !rest.starts_with('|') {
        return None;
    }
    Some(&rest[close + 1..])
}
