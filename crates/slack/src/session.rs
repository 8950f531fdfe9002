//! The session aggregate: one live connection per bot token.
//!
//! ```text
//! SessionRegistry::session ─▶ Bootstrapper::start ─▶ Session::apply_snapshot
//!                                                        │
//!                       StreamConnector::open ◀──────────┘
//!                                │
//!            StreamEvent::{Open, Frame, Closed} ─▶ pump ─▶ fan_out ─▶ handlers
//! ```
//!
//! Directory, handlers and the outbound leg live behind one mutex that is
//! never held while callbacks run, so handlers may call back into the
//! session (for example to reply).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chatterbox_core::config::{RuntimeMode, SlackConfig};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    bootstrap::{BootstrapError, Bootstrapper},
    channel::ChannelRef,
    directory::{Directory, Snapshot},
    dispatch::{
        decode_frame, fan_out, Admission, ChannelListener, DispatchState, InboundEvent,
        MessageFilter,
    },
    format::{format_message, FormatError, MessagePayload, OutboundMessage},
    handler::{Handler, MessageCallback, Selector},
    message::{InboundMessage, Message},
    transport::{StreamConnector, StreamEvent, TransportError},
    webhook::{WebhookConfig, WebhookNotifier, WebhookSetting},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("streaming connection is not open")]
    NotConnected,
    #[error("streaming connection closed; session does not reconnect")]
    Closed,
    #[error("outbound frame could not be encoded: {0}")]
    Encode(String),
    #[error("sessions must be created inside a tokio runtime: {0}")]
    Runtime(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(BootstrapError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendRoute {
    Stream { id: u64 },
    Webhook,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub token: SecretString,
    pub webhook: Option<WebhookSetting>,
    pub im_prefix: Option<String>,
    pub dev_channel: Option<String>,
}

impl SessionOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: SecretString::from(token.into()), webhook: None, im_prefix: None, dev_channel: None }
    }

    pub fn from_config(config: &SlackConfig) -> Self {
        Self {
            token: config.bot_token.clone(),
            webhook: config.webhook.as_ref().map(|webhook| WebhookSetting::Config(WebhookConfig::from(webhook))),
            im_prefix: config.im_prefix.clone(),
            dev_channel: config.dev_channel.clone(),
        }
    }

    pub fn webhook(mut self, setting: WebhookSetting) -> Self {
        self.webhook = Some(setting);
        self
    }

    pub fn im_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.im_prefix = Some(prefix.into());
        self
    }

    pub fn dev_channel(mut self, reference: impl Into<String>) -> Self {
        self.dev_channel = Some(reference.into());
        self
    }
}

/// Token-keyed session map owned by the composition root.
pub struct SessionRegistry {
    bootstrapper: Arc<dyn Bootstrapper>,
    connector: Arc<dyn StreamConnector>,
    mode: RuntimeMode,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(
        bootstrapper: Arc<dyn Bootstrapper>,
        connector: Arc<dyn StreamConnector>,
        mode: RuntimeMode,
    ) -> Self {
        Self { bootstrapper, connector, mode, sessions: Mutex::new(HashMap::new()) }
    }

    /// Returns the live session for the token, creating it and starting the
    /// handshake in the background on first use. The first call for a token
    /// must run inside a tokio runtime; the session keeps that runtime's handle
    /// for its background work, so later calls may come from any thread.
    pub fn session(&self, options: SessionOptions) -> Result<Arc<Session>, SessionError> {
        let key = options.token.expose_secret().to_owned();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = sessions.get(&key) {
            debug!(event_name = "system.session.reused", "returning existing session for token");
            return Ok(Arc::clone(existing));
        }

        let session = Arc::new(Session::new(options, self.mode, Arc::clone(&self.connector))?);
        sessions.insert(key, Arc::clone(&session));
        drop(sessions);

        session.start(Arc::clone(&self.bootstrapper));
        Ok(session)
    }

    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SessionState {
    directory: Directory,
    channels: Vec<Arc<ChannelRef>>,
    handlers: Vec<Handler>,
    listeners: HashMap<String, Vec<ChannelListener>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    last_message_id: u64,
    generation: u64,
}

pub struct Session {
    token: SecretString,
    mode: RuntimeMode,
    im_prefix: Option<String>,
    dev_channel: Option<String>,
    webhook: Option<Arc<dyn WebhookNotifier>>,
    connector: Arc<dyn StreamConnector>,
    runtime: Handle,
    readiness: watch::Sender<Readiness>,
    dispatch: watch::Sender<DispatchState>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(
        options: SessionOptions,
        mode: RuntimeMode,
        connector: Arc<dyn StreamConnector>,
    ) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|error| SessionError::Runtime(error.to_string()))?;
        let webhook = options.webhook.map(WebhookSetting::into_notifier).transpose()?;
        let (readiness, _) = watch::channel(Readiness::Pending);
        let (dispatch, _) = watch::channel(DispatchState::Idle);

        Ok(Self {
            token: options.token,
            mode,
            im_prefix: options.im_prefix,
            dev_channel: options.dev_channel,
            webhook,
            connector,
            runtime,
            readiness,
            dispatch,
            state: Mutex::new(SessionState {
                directory: Directory::empty(),
                channels: Vec::new(),
                handlers: Vec::new(),
                listeners: HashMap::new(),
                outbound: None,
                last_message_id: 0,
                generation: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(self: &Arc<Self>, bootstrapper: Arc<dyn Bootstrapper>) {
        let session = Arc::clone(self);
        self.runtime.spawn(async move {
            info!(
                event_name = "system.session.bootstrap_started",
                mode = session.mode.as_str(),
                "starting session handshake"
            );
            let outcome = match bootstrapper.start(&session.token).await {
                Ok(snapshot) => session.apply_snapshot(snapshot).await,
                Err(error) => Err(error),
            };
            if let Err(error) = outcome {
                session.fail(error);
            }
        });
    }

    fn fail(&self, failure: BootstrapError) {
        error!(
            event_name = "system.session.bootstrap_failed",
            error = %failure,
            "session could not be established"
        );
        self.readiness.send_if_modified(|readiness| match readiness {
            Readiness::Pending => {
                *readiness = Readiness::Failed(failure);
                true
            }
            _ => false,
        });
    }

    /// Replaces the directory, re-resolves registered channel references and
    /// opens a new streaming connection to the snapshot's endpoint. Frames
    /// from any earlier connection stop being dispatched.
    pub async fn apply_snapshot(self: &Arc<Self>, snapshot: Snapshot) -> Result<(), BootstrapError> {
        let url = snapshot.url.clone();
        let directory = Directory::new(snapshot);

        let generation = {
            let mut state = self.state();
            for channel in &state.channels {
                channel.set_channels(&directory);
            }
            state.directory = directory;
            state.outbound = None;
            self.dispatch.send_replace(DispatchState::Idle);
            state.generation += 1;
            state.generation
        };
        info!(event_name = "system.session.snapshot_applied", generation, "directory snapshot applied");

        let connection = match self.connector.open(&url).await {
            Ok(connection) => connection,
            Err(error) => {
                if self.state().generation == generation {
                    self.dispatch.send_replace(DispatchState::Closed);
                }
                warn!(
                    event_name = "system.stream.open_failed",
                    generation,
                    error = %error,
                    "streaming connection could not be opened"
                );
                return Err(BootstrapError::Stream(error.to_string()));
            }
        };

        let session = Arc::clone(self);
        self.runtime.spawn(session.pump(connection.inbound, connection.outbound, generation));
        Ok(())
    }

    async fn pump(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<StreamEvent>,
        outbound: mpsc::UnboundedSender<String>,
        generation: u64,
    ) {
        let mut pending_outbound = Some(outbound);

        while let Some(event) = inbound.recv().await {
            if self.state().generation != generation {
                debug!(generation, "streaming connection superseded; stopping dispatch");
                return;
            }

            match event {
                StreamEvent::Open => {
                    {
                        let mut state = self.state();
                        if let Some(sender) = pending_outbound.take() {
                            state.outbound = Some(sender);
                        }
                        self.dispatch.send_replace(DispatchState::Streaming);
                    }
                    let first_open = self.readiness.send_if_modified(|readiness| {
                        if matches!(readiness, Readiness::Pending) {
                            *readiness = Readiness::Ready;
                            true
                        } else {
                            false
                        }
                    });
                    info!(
                        event_name = "system.stream.open",
                        generation,
                        first_open,
                        "streaming connection open"
                    );
                }
                StreamEvent::Frame(frame) => self.handle_frame(&frame),
                StreamEvent::Closed => break,
            }
        }

        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            self.dispatch.send_replace(DispatchState::Closed);
            state.outbound = None;
        }
        if matches!(*self.readiness.borrow(), Readiness::Pending) {
            self.fail(BootstrapError::Stream("closed before it opened".to_owned()));
        }
        warn!(
            event_name = "system.stream.closed",
            generation,
            "streaming connection closed; session stops dispatching"
        );
    }

    fn handle_frame(&self, frame: &str) {
        trace!(event_name = "ingress.stream.frame_received", frame, "frame received");

        let event = match decode_frame(frame) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    event_name = "ingress.stream.decode_failed",
                    error = %error,
                    frame_len = frame.len(),
                    "dropping frame that could not be decoded"
                );
                return;
            }
        };
        trace!(event_type = event.event_type(), "frame decoded");

        match event {
            InboundEvent::Message(raw) => self.handle_message(raw),
            InboundEvent::Hello => debug!(event_name = "ingress.stream.hello", "platform greeted the connection"),
            InboundEvent::Reply { reply_to, ok: true } => {
                debug!(event_name = "ingress.stream.ack", reply_to, "outbound message acknowledged")
            }
            InboundEvent::Reply { reply_to, ok: false } => {
                warn!(event_name = "ingress.stream.ack", reply_to, "platform rejected outbound message")
            }
            InboundEvent::Unsupported { event_type } => {
                trace!(event_type = %event_type, "ignoring unsupported event type")
            }
        }
    }

    fn handle_message(&self, raw: InboundMessage) {
        if *self.dispatch.borrow() != DispatchState::Streaming {
            return;
        }

        let (handlers, listeners, directory) = {
            let state = self.state();

            let filter = MessageFilter::new(self.mode, self.dev_channel.as_deref(), &state.directory);
            let admission = filter.admit(&raw);
            if admission != Admission::Dispatch {
                debug!(
                    event_name = "ingress.dispatch.discarded",
                    reason = ?admission,
                    channel = raw.channel.as_deref().unwrap_or("unknown"),
                    "message discarded before dispatch"
                );
                return;
            }

            let listeners = raw
                .channel
                .as_deref()
                .and_then(|channel| state.listeners.get(channel))
                .cloned()
                .unwrap_or_default();
            (state.handlers.clone(), listeners, state.directory.clone())
        };

        let bot_id = directory.identity().map(|identity| identity.id.as_str());
        let message = Message::new(raw, bot_id, self.im_prefix.as_deref());
        let matched = fan_out(&handlers, &listeners, &message, &directory);

        debug!(
            event_name = "ingress.dispatch.completed",
            channel = message.channel_id().unwrap_or("unknown"),
            ts = message.ts().unwrap_or("none"),
            handlers = handlers.len(),
            matched,
            listeners = listeners.len(),
            "message dispatched"
        );
    }

    /// Registers a destination whose id is refreshed on every snapshot.
    pub fn channel(&self, name: impl Into<String>) -> Arc<ChannelRef> {
        let channel = Arc::new(ChannelRef::new(name));
        let mut state = self.state();
        channel.set_channels(&state.directory);
        state.channels.push(Arc::clone(&channel));
        channel
    }

    pub fn on<F>(&self, selector: Selector, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.state().handlers.push(Handler::new(selector, callback));
    }

    pub fn on_many<I>(&self, registrations: I)
    where
        I: IntoIterator<Item = (Selector, MessageCallback)>,
    {
        let mut state = self.state();
        for (selector, callback) in registrations {
            state.handlers.push(Handler::from_callback(selector, callback));
        }
    }

    /// Returns the resolved channel id, or `None` when the directory cannot
    /// resolve the reference yet.
    pub fn on_channel_message<F>(&self, reference: &str, callback: F) -> Option<String>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let Some(channel_id) =
            state.directory.channel_data(reference).map(|conversation| conversation.id().to_owned())
        else {
            warn!(
                event_name = "system.session.channel_unresolved",
                reference,
                "channel listener not registered; directory cannot resolve reference"
            );
            return None;
        };

        state.listeners.entry(channel_id.clone()).or_default().push(Arc::new(callback));
        Some(channel_id)
    }

    /// Normalizes the payload, resolves its channel to an id and picks a leg:
    /// attachment messages go to the webhook when one is configured.
    pub fn send_message(
        &self,
        payload: impl Into<MessagePayload>,
    ) -> Result<SendRoute, SessionError> {
        let mut message = format_message(payload)?;

        let resolved = message.channel.as_deref().and_then(|reference| {
            self.state().directory.channel_data(reference).map(|conversation| conversation.id().to_owned())
        });
        if let Some(channel_id) = resolved {
            message.channel = Some(channel_id);
        }

        if message.has_attachments() {
            if let Some(notifier) = &self.webhook {
                let notifier = Arc::clone(notifier);
                debug!(
                    event_name = "egress.webhook.queued",
                    channel = message.channel.as_deref().unwrap_or("unknown"),
                    "message sent via webhook client"
                );
                self.runtime.spawn(async move {
                    if let Err(error) = notifier.notify(&message).await {
                        warn!(
                            event_name = "egress.webhook.failed",
                            error = %error,
                            "webhook delivery failed"
                        );
                    }
                });
                return Ok(SendRoute::Webhook);
            }
        }

        let id = self.send(message)?;
        Ok(SendRoute::Stream { id })
    }

    /// Stamps the next message id and writes the frame to the streaming leg.
    pub fn send(&self, mut message: OutboundMessage) -> Result<u64, SessionError> {
        let mut state = self.state();
        let Some(outbound) = state.outbound.as_ref() else {
            return Err(match *self.dispatch.borrow() {
                DispatchState::Closed => SessionError::Closed,
                _ => SessionError::NotConnected,
            });
        };

        let id = state.last_message_id + 1;
        message.id = Some(id);
        let frame =
            serde_json::to_string(&message).map_err(|error| SessionError::Encode(error.to_string()))?;
        outbound
            .send(frame)
            .map_err(|_| TransportError::Send("streaming connection dropped".to_owned()))?;
        state.last_message_id = id;

        debug!(
            event_name = "egress.stream.sent",
            message_id = id,
            channel = message.channel.as_deref().unwrap_or("unknown"),
            "message sent via streaming connection"
        );
        Ok(id)
    }

    /// Resolves once the first streaming connection reports open, or fails
    /// with the handshake error.
    pub async fn connected(&self) -> Result<(), SessionError> {
        let mut receiver = self.readiness.subscribe();
        let readiness = receiver
            .wait_for(|readiness| !matches!(readiness, Readiness::Pending))
            .await
            .map_err(|_| SessionError::NotConnected)?
            .clone();

        match readiness {
            Readiness::Ready => Ok(()),
            Readiness::Failed(error) => Err(SessionError::Bootstrap(error)),
            Readiness::Pending => Err(SessionError::NotConnected),
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    pub fn name(&self) -> Option<String> {
        self.state().directory.identity().map(|identity| identity.name.clone())
    }

    pub fn id(&self) -> Option<String> {
        self.state().directory.identity().map(|identity| identity.id.clone())
    }

    pub fn directory(&self) -> Directory {
        self.state().directory.clone()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        *self.dispatch.borrow()
    }

    /// Resolves when the current streaming connection closes.
    pub async fn closed(&self) {
        let mut receiver = self.dispatch.subscribe();
        let _ = receiver.wait_for(|state| *state == DispatchState::Closed).await;
    }

    pub fn last_message_id(&self) -> u64 {
        self.state().last_message_id
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn dev_channel(&self) -> Option<&str> {
        self.dev_channel.as_deref()
    }

    pub fn im_prefix(&self) -> Option<&str> {
        self.im_prefix.as_deref()
    }

    pub fn has_webhook(&self) -> bool {
        self.webhook.is_some()
    }
}
