//! Streaming leg: a bidirectional connection bridged onto channels.
//!
//! The session never touches the socket directly. A [`StreamConnector`] hands
//! back a [`StreamConnection`] whose outbound sender accepts encoded frames
//! and whose inbound receiver yields [`StreamEvent`]s in delivery order.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("webhook delivery failed: {0}")]
    Webhook(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Open,
    Frame(String),
    Closed,
}

#[derive(Debug)]
pub struct StreamConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<StreamEvent>,
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<StreamConnection, TransportError>;
}

#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<StreamConnection, TransportError> {
        info!(event_name = "system.stream.connecting", "opening streaming connection");
        let (socket, _response) =
            connect_async(url).await.map_err(|error| TransportError::Connect(error.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let _ = event_tx.send(StreamEvent::Open);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(error) = sink.send(WsMessage::Text(frame.into())).await {
                    warn!(
                        event_name = "egress.stream.write_failed",
                        error = %error,
                        "failed to write outbound frame; stopping writer"
                    );
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                let frame = match next {
                    Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(error) => {
                            warn!(
                                event_name = "ingress.stream.invalid_utf8",
                                error = %error,
                                "dropping binary frame that is not utf-8"
                            );
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                    Err(error) => {
                        warn!(
                            event_name = "ingress.stream.read_failed",
                            error = %error,
                            "streaming connection read failed"
                        );
                        break;
                    }
                };

                if event_tx.send(StreamEvent::Frame(frame)).is_err() {
                    debug!("stream consumer dropped; stopping reader");
                    return;
                }
            }

            info!(event_name = "system.stream.closed", "streaming connection closed");
            let _ = event_tx.send(StreamEvent::Closed);
        });

        Ok(StreamConnection { outbound: outbound_tx, inbound: event_rx })
    }
}
