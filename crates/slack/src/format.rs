use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

fn message_kind() -> String {
    "message".to_owned()
}

/// Canonical outbound record shared by the streaming and webhook legs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type", default = "message_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: message_kind(),
            channel: Some(channel.into()),
            text: Some(text.into()),
            attachments: None,
            extra: Map::new(),
        }
    }

    pub fn with_attachments(channel: impl Into<String>, attachments: Vec<Value>) -> Self {
        Self {
            id: None,
            kind: message_kind(),
            channel: Some(channel.into()),
            text: None,
            attachments: Some(attachments),
            extra: Map::new(),
        }
    }

    pub fn attachment(mut self, attachment: Value) -> Self {
        self.attachments.get_or_insert_with(Vec::new).push(attachment);
        self
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments.as_ref().is_some_and(|attachments| !attachments.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessagePayload {
    Message(OutboundMessage),
    Json(Value),
}

impl From<OutboundMessage> for MessagePayload {
    fn from(value: OutboundMessage) -> Self {
        Self::Message(value)
    }
}

impl From<Value> for MessagePayload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("outbound payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("outbound payload is malformed: {0}")]
    Malformed(String),
    #[error("outbound message does not name a channel")]
    MissingChannel,
    #[error("outbound message carries neither text nor attachments")]
    EmptyBody,
}

pub fn format_message(payload: impl Into<MessagePayload>) -> Result<OutboundMessage, FormatError> {
    let message = match payload.into() {
        MessagePayload::Message(message) => message,
        MessagePayload::Json(value) => from_json(value)?,
    };

    if message.channel.as_deref().map_or(true, |channel| channel.trim().is_empty()) {
        return Err(FormatError::MissingChannel);
    }
    let has_text = message.text.as_deref().is_some_and(|text| !text.is_empty());
    if !has_text && !message.has_attachments() {
        return Err(FormatError::EmptyBody);
    }

    Ok(message)
}

fn from_json(value: Value) -> Result<OutboundMessage, FormatError> {
    let mut object = match value {
        Value::Object(object) => object,
        other => return Err(FormatError::NotAnObject(json_kind(&other))),
    };

    // a lone attachment object is accepted in place of a list
    if let Some(single @ Value::Object(_)) = object.get("attachments").cloned() {
        object.insert("attachments".to_owned(), Value::Array(vec![single]));
    }

    serde_json::from_value(Value::Object(object))
        .map_err(|error| FormatError::Malformed(error.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
