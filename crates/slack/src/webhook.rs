use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{format::OutboundMessage, transport::TransportError};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// The notification leg: posts a canonical message to an incoming webhook.
#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    async fn notify(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Defaults merged into every posted message that does not set them itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebhookOptions {
    pub channel: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
    pub icon_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub options: WebhookOptions,
}

/// Either a ready-made notifier or the configuration to build one from.
#[derive(Clone)]
pub enum WebhookSetting {
    Client(Arc<dyn WebhookNotifier>),
    Config(WebhookConfig),
}

impl fmt::Debug for WebhookSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(_) => f.write_str("WebhookSetting::Client(..)"),
            Self::Config(config) => f
                .debug_struct("WebhookSetting::Config")
                .field("url", &"<redacted>")
                .field("options", &config.options)
                .finish(),
        }
    }
}

impl WebhookSetting {
    pub fn into_notifier(self) -> Result<Arc<dyn WebhookNotifier>, TransportError> {
        match self {
            Self::Client(client) => Ok(client),
            Self::Config(config) => Ok(Arc::new(WebhookClient::new(config.url, config.options)?)),
        }
    }
}

impl From<&chatterbox_core::config::WebhookConfig> for WebhookConfig {
    fn from(config: &chatterbox_core::config::WebhookConfig) -> Self {
        use secrecy::ExposeSecret;

        Self {
            url: config.url.expose_secret().to_owned(),
            options: WebhookOptions {
                channel: config.channel.clone(),
                username: config.username.clone(),
                icon_emoji: config.icon_emoji.clone(),
                icon_url: config.icon_url.clone(),
            },
        }
    }
}

pub struct WebhookClient {
    url: String,
    options: WebhookOptions,
    client: Client,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, options: WebhookOptions) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|error| TransportError::Webhook(error.to_string()))?;
        Ok(Self { url: url.into(), options, client })
    }

    pub fn options(&self) -> &WebhookOptions {
        &self.options
    }
}

#[async_trait]
impl WebhookNotifier for WebhookClient {
    async fn notify(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let payload = webhook_payload(message, &self.options)?;

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| TransportError::Webhook(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Webhook(format!("webhook returned {status}: {body}")));
        }

        debug!(event_name = "egress.webhook.delivered", status = %status, "webhook accepted message");
        Ok(())
    }
}

pub(crate) fn webhook_payload(
    message: &OutboundMessage,
    options: &WebhookOptions,
) -> Result<Value, TransportError> {
    let encoded =
        serde_json::to_value(message).map_err(|error| TransportError::Webhook(error.to_string()))?;
    let mut object = match encoded {
        Value::Object(object) => object,
        _ => Map::new(),
    };

    // ids and the event type only mean something on the streaming leg
    object.remove("id");
    object.remove("type");

    let defaults = [
        ("channel", &options.channel),
        ("username", &options.username),
        ("icon_emoji", &options.icon_emoji),
        ("icon_url", &options.icon_url),
    ];
    for (key, value) in defaults {
        if let Some(value) = value {
            object.entry(key).or_insert_with(|| Value::String(value.clone()));
        }
    }

    Ok(Value::Object(object))
}
