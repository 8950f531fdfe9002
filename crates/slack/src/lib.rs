//! Slack Integration - real-time bot session
//!
//! This crate provides the session layer for chatterbox:
//! - **Bootstrap** (`bootstrap`) - `rtm.start` handshake returning the initial snapshot
//! - **Directory** (`directory`) - channel, user and IM lookup over the snapshot
//! - **Dispatch** (`dispatch`) - frame decoding, bot/dev-channel filtering, handler fan-out
//! - **Transport** (`transport`, `webhook`) - WebSocket streaming leg and incoming-webhook leg
//! - **Session** (`session`) - one live session per token, outbound ids, readiness
//!
//! # Getting Started
//!
//! 1. Create a bot user and copy its `xoxb-` token
//! 2. Set `CHATTERBOX_SLACK_BOT_TOKEN` (and optionally `CHATTERBOX_SLACK_WEBHOOK_URL`)
//! 3. Build a [`SessionRegistry`] and call [`SessionRegistry::session`]
//!
//! # Architecture
//!
//! ```text
//! rtm.start → Snapshot → Directory
//!                 ↓
//!           WebSocket frames → MessageFilter → Handlers (newest first) → Channel listeners
//!                                                   ↓
//!                        send_message → stream (ids 1, 2, 3...) | webhook (attachments)
//! ```
//!
//! # Key Types
//!
//! - `SessionRegistry` - Token-keyed session map, owns the bootstrapper and connector
//! - `Session` - Directory, handlers, outbound counter and readiness for one token
//! - `Selector` - What a handler listens for (text, pattern, channel, user, mentions)
//! - `OutboundMessage` - Canonical outbound record for both transport legs

pub mod bootstrap;
pub mod channel;
pub mod directory;
pub mod dispatch;
pub mod format;
pub mod handler;
pub mod message;
pub mod session;
pub mod transport;
pub mod webhook;

pub use bootstrap::{BootstrapError, Bootstrapper, HttpBootstrapper};
pub use channel::ChannelRef;
pub use directory::{Conversation, Directory, Snapshot};
pub use dispatch::{DispatchState, InboundEvent};
pub use format::{format_message, FormatError, MessagePayload, OutboundMessage};
pub use handler::{Handler, MessageCallback, Selector};
pub use message::{InboundMessage, Message};
pub use session::{Readiness, SendRoute, Session, SessionError, SessionOptions, SessionRegistry};
pub use transport::{StreamConnection, StreamConnector, StreamEvent, TransportError, WebSocketConnector};
pub use webhook::{WebhookClient, WebhookConfig, WebhookNotifier, WebhookOptions, WebhookSetting};
