use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use chatterbox_core::config::RuntimeMode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{
    directory::Directory,
    handler::Handler,
    message::{InboundMessage, Message},
};

pub type ChannelListener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Idle,
    Streaming,
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    Hello,
    Message(InboundMessage),
    /// Acknowledgement of an outbound frame, correlated by its `id`.
    Reply { reply_to: u64, ok: bool },
    Unsupported { event_type: String },
}

impl InboundEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Hello => "hello",
            Self::Message(_) => "message",
            Self::Reply { .. } => "reply",
            Self::Unsupported { event_type } => event_type,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("`{event_type}` event is malformed: {reason}")]
    Malformed { event_type: String, reason: String },
}

#[derive(Deserialize)]
struct ReplyFrame {
    reply_to: u64,
    #[serde(default)]
    ok: bool,
}

pub fn decode_frame(frame: &str) -> Result<InboundEvent, DecodeError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|error| DecodeError::Json(error.to_string()))?;
    let Value::Object(object) = &value else {
        return Err(DecodeError::NotAnObject);
    };

    let event_type = object.get("type").and_then(Value::as_str).map(str::to_owned);
    let is_reply = object.contains_key("reply_to");
    match event_type.as_deref() {
        Some("hello") => Ok(InboundEvent::Hello),
        Some("message") => serde_json::from_value(value)
            .map(InboundEvent::Message)
            .map_err(|error| malformed("message", error)),
        Some(other) => Ok(InboundEvent::Unsupported { event_type: other.to_owned() }),
        None if is_reply => serde_json::from_value::<ReplyFrame>(value)
            .map(|reply| InboundEvent::Reply { reply_to: reply.reply_to, ok: reply.ok })
            .map_err(|error| malformed("reply", error)),
        None => Ok(InboundEvent::Unsupported { event_type: "untyped".to_owned() }),
    }
}

fn malformed(event_type: &str, error: serde_json::Error) -> DecodeError {
    DecodeError::Malformed { event_type: event_type.to_owned(), reason: error.to_string() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Dispatch,
    BotMessage,
    OutsideDevChannel,
    DevChannelReserved,
}

/// Bot suppression plus dev-channel exclusivity.
///
/// With a dev channel configured, development mode only sees that channel
/// and production mode never sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFilter {
    pub mode: RuntimeMode,
    pub dev_channel_id: Option<String>,
    pub dev_channel_configured: bool,
}

impl MessageFilter {
    pub fn new(mode: RuntimeMode, dev_channel: Option<&str>, directory: &Directory) -> Self {
        let dev_channel_id = dev_channel
            .and_then(|reference| directory.channel_or_im_data(reference))
            .map(|conversation| conversation.id().to_owned());
        Self { mode, dev_channel_id, dev_channel_configured: dev_channel.is_some() }
    }

    pub fn admit(&self, message: &InboundMessage) -> Admission {
        if message.is_bot_message() {
            return Admission::BotMessage;
        }
        if !self.dev_channel_configured {
            return Admission::Dispatch;
        }

        let in_dev_channel = match (&self.dev_channel_id, &message.channel) {
            (Some(dev), Some(channel)) => dev == channel,
            _ => false,
        };
        match (self.mode.is_development(), in_dev_channel) {
            (true, false) => Admission::OutsideDevChannel,
            (false, true) => Admission::DevChannelReserved,
            _ => Admission::Dispatch,
        }
    }
}

/// Consults every handler, newest first, then the channel listeners in
/// registration order. A panicking callback is logged and skipped.
pub fn fan_out(
    handlers: &[Handler],
    listeners: &[ChannelListener],
    message: &Message,
    directory: &Directory,
) -> usize {
    let mut matched = 0;

    for (index, handler) in handlers.iter().enumerate().rev() {
        match catch_unwind(AssertUnwindSafe(|| handler.matches(message, directory))) {
            Ok(true) => matched += 1,
            Ok(false) => {}
            Err(_) => warn!(
                event_name = "ingress.dispatch.handler_panicked",
                handler_index = index,
                channel = message.channel_id().unwrap_or("unknown"),
                "message handler panicked; continuing with remaining handlers"
            ),
        }
    }

    for (index, listener) in listeners.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| listener(message.raw()))).is_err() {
            warn!(
                event_name = "ingress.dispatch.listener_panicked",
                listener_index = index,
                channel = message.channel_id().unwrap_or("unknown"),
                "channel listener panicked; continuing with remaining listeners"
            );
        }
    }

    matched
}
