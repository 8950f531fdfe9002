use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::directory::Snapshot;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("handshake request failed: {0}")]
    Request(String),
    #[error("handshake returned HTTP {status}")]
    Status { status: u16 },
    #[error("handshake body is malformed: {0}")]
    Malformed(String),
    #[error("platform rejected the handshake: {0}")]
    Rejected(String),
    #[error("streaming connection could not be opened: {0}")]
    Stream(String),
}

/// Performs the authenticated handshake and returns the initial snapshot,
/// which carries the streaming endpoint in its `url` field.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn start(&self, token: &SecretString) -> Result<Snapshot, BootstrapError>;
}

pub struct HttpBootstrapper {
    api_base_url: String,
    client: Client,
}

impl HttpBootstrapper {
    pub fn new(api_base_url: impl Into<String>) -> Result<Self, BootstrapError> {
        let client = Client::builder()
            .timeout(HANDSHAKE_TIMEOUT)
            .build()
            .map_err(|error| BootstrapError::Request(error.to_string()))?;
        Ok(Self { api_base_url: api_base_url.into(), client })
    }

    fn start_url(&self) -> String {
        format!("{}/rtm.start", self.api_base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Bootstrapper for HttpBootstrapper {
    async fn start(&self, token: &SecretString) -> Result<Snapshot, BootstrapError> {
        let response = self
            .client
            .get(self.start_url())
            .query(&[("token", token.expose_secret())])
            .send()
            .await
            .map_err(|error| BootstrapError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::Status { status: status.as_u16() });
        }

        let body = response.text().await.map_err(|error| BootstrapError::Request(error.to_string()))?;
        let snapshot = parse_start_response(&body)?;

        info!(
            event_name = "system.bootstrap.handshake_completed",
            bot_id = %snapshot.identity.id,
            channels = snapshot.channels.len(),
            users = snapshot.users.len(),
            ims = snapshot.ims.len(),
            "handshake completed"
        );
        Ok(snapshot)
    }
}

#[derive(Deserialize)]
struct StartEnvelope {
    #[serde(default = "default_ok")]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_ok() -> bool {
    true
}

pub fn parse_start_response(body: &str) -> Result<Snapshot, BootstrapError> {
    let envelope: StartEnvelope =
        serde_json::from_str(body).map_err(|error| BootstrapError::Malformed(error.to_string()))?;
    if !envelope.ok {
        return Err(BootstrapError::Rejected(
            envelope.error.unwrap_or_else(|| "unknown_error".to_owned()),
        ));
    }

    serde_json::from_str(body).map_err(|error| BootstrapError::Malformed(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{parse_start_response, BootstrapError, HttpBootstrapper};

    #[test]
    fn parses_successful_handshake() {
        let snapshot = parse_start_response(
            r#"{
                "ok": true,
                "self": {"id": "UBOT", "name": "chatterbox"},
                "url": "wss://stream.example.test/ws",
                "channels": [{"id": "C1", "name": "general"}],
                "users": [{"id": "U1", "name": "alice"}],
                "ims": [{"id": "D1", "user": "U1"}]
            }"#,
        )
        .expect("handshake should parse");

        assert_eq!(snapshot.url, "wss://stream.example.test/ws");
        assert_eq!(snapshot.identity.id, "UBOT");
        assert_eq!(snapshot.ims[0].user, "U1");
    }

    #[test]
    fn platform_rejection_is_surfaced() {
        let error = parse_start_response(r#"{"ok": false, "error": "invalid_auth"}"#)
            .expect_err("rejection should fail");

        assert_eq!(error, BootstrapError::Rejected("invalid_auth".to_owned()));
    }

    #[test]
    fn malformed_bodies_are_reported() {
        assert!(matches!(parse_start_response("<html>"), Err(BootstrapError::Malformed(_))));
        assert!(matches!(
            parse_start_response(r#"{"ok": true, "self": {"id": "UBOT"}}"#),
            Err(BootstrapError::Malformed(_))
        ));
    }

    #[test]
    fn start_url_tolerates_trailing_slash() {
        let bootstrapper =
            HttpBootstrapper::new("https://slack.example.test/api/").expect("client");
        assert_eq!(bootstrapper.start_url(), "https://slack.example.test/api/rtm.start");
    }
}
