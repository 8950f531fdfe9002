use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chatterbox_core::config::RuntimeMode;
use chatterbox_slack::{
    directory::{ChannelRecord, ImRecord, SelfIdentity, UserRecord},
    BootstrapError, Bootstrapper, Conversation, Directory, OutboundMessage, Selector, SendRoute,
    SessionOptions, SessionRegistry, Snapshot, StreamConnection, StreamConnector, StreamEvent,
    TransportError, WebhookNotifier, WebhookSetting,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn snapshot() -> Snapshot {
    Snapshot {
        identity: SelfIdentity { id: "UBOT".to_owned(), name: "chatterbox".to_owned() },
        url: "wss://stream.example.test/websocket".to_owned(),
        channels: vec![
            ChannelRecord { id: "C1".to_owned(), name: "general".to_owned() },
            ChannelRecord { id: "C9".to_owned(), name: "dev".to_owned() },
        ],
        users: vec![UserRecord { id: "U1".to_owned(), name: "alice".to_owned() }],
        ims: vec![ImRecord { id: "D1".to_owned(), user: "U1".to_owned() }],
    }
}

#[derive(Default)]
struct CountingBootstrapper {
    calls: AtomicUsize,
}

#[async_trait]
impl Bootstrapper for CountingBootstrapper {
    async fn start(&self, _token: &SecretString) -> Result<Snapshot, BootstrapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(snapshot())
    }
}

struct Peer {
    events: mpsc::UnboundedSender<StreamEvent>,
    sent: mpsc::UnboundedReceiver<String>,
}

struct ChannelConnector {
    peers: mpsc::UnboundedSender<Peer>,
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    async fn open(&self, _url: &str) -> Result<StreamConnection, TransportError> {
        let (events, inbound) = mpsc::unbounded_channel();
        let (outbound, sent) = mpsc::unbounded_channel();
        self.peers
            .send(Peer { events, sent })
            .map_err(|_| TransportError::Connect("test harness dropped".to_owned()))?;
        Ok(StreamConnection { outbound, inbound })
    }
}

struct RecordingNotifier {
    posted: mpsc::UnboundedSender<OutboundMessage>,
}

#[async_trait]
impl WebhookNotifier for RecordingNotifier {
    async fn notify(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let _ = self.posted.send(message.clone());
        Ok(())
    }
}

fn registry(mode: RuntimeMode) -> (SessionRegistry, Arc<CountingBootstrapper>, mpsc::UnboundedReceiver<Peer>) {
    let bootstrapper = Arc::new(CountingBootstrapper::default());
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let registry = SessionRegistry::new(
        bootstrapper.clone(),
        Arc::new(ChannelConnector { peers: peers_tx }),
        mode,
    );
    (registry, bootstrapper, peers)
}

async fn recv<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> Result<T, String> {
    tokio::time::timeout(WAIT, receiver.recv())
        .await
        .map_err(|_| "timed out waiting for value".to_owned())?
        .ok_or_else(|| "channel closed".to_owned())
}

async fn open(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Result<Peer, String> {
    let peer = recv(peers).await?;
    peer.events.send(StreamEvent::Open).map_err(|error| error.to_string())?;
    Ok(peer)
}

fn message_frame(channel: &str, text: &str) -> StreamEvent {
    StreamEvent::Frame(json!({"type": "message", "channel": channel, "user": "U1", "text": text}).to_string())
}

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

#[tokio::test]
async fn one_session_per_token() -> Result<(), String> {
    let (registry, bootstrapper, mut peers) = registry(RuntimeMode::Production);

    let first = registry.session(SessionOptions::new("xoxb-shared")).map_err(|e| e.to_string())?;
    let _peer = open(&mut peers).await?;
    first.connected().await.map_err(|e| e.to_string())?;

    let second = registry.session(SessionOptions::new("xoxb-shared")).map_err(|e| e.to_string())?;
    let other = registry.session(SessionOptions::new("xoxb-other")).map_err(|e| e.to_string())?;
    let _other_peer = open(&mut peers).await?;
    other.connected().await.map_err(|e| e.to_string())?;

    ensure(Arc::ptr_eq(&first, &second), "same token must share a session")?;
    ensure(!Arc::ptr_eq(&first, &other), "different tokens must not share a session")?;
    ensure(bootstrapper.calls.load(Ordering::SeqCst) == 2, "one handshake per distinct token")?;
    ensure(registry.len() == 2, "registry tracks both tokens")
}

#[tokio::test]
async fn stream_ids_count_up_across_snapshot_replacement() -> Result<(), String> {
    let (registry, _, mut peers) = registry(RuntimeMode::Production);
    let session = registry.session(SessionOptions::new("xoxb-1")).map_err(|e| e.to_string())?;
    let mut peer = open(&mut peers).await?;
    session.connected().await.map_err(|e| e.to_string())?;

    let mut ids = Vec::new();
    for text in ["a", "b"] {
        if let SendRoute::Stream { id } =
            session.send_message(OutboundMessage::new("#general", text)).map_err(|e| e.to_string())?
        {
            ids.push(id);
        }
    }

    session.apply_snapshot(snapshot()).await.map_err(|e| e.to_string())?;
    let mut replacement = open(&mut peers).await?;
    tokio::time::timeout(WAIT, async {
        while session.dispatch_state() != chatterbox_slack::DispatchState::Streaming {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| "replacement stream never opened".to_owned())?;

    for text in ["c", "d"] {
        if let SendRoute::Stream { id } =
            session.send_message(OutboundMessage::new("#general", text)).map_err(|e| e.to_string())?
        {
            ids.push(id);
        }
    }

    ensure(ids == vec![1, 2, 3, 4], format!("ids should be 1..=4, got {ids:?}"))?;
    ensure(session.last_message_id() == 4, "counter tracks the last stamped id")?;

    let first: Value = serde_json::from_str(&recv(&mut peer.sent).await?).map_err(|e| e.to_string())?;
    let third: Value =
        serde_json::from_str(&recv(&mut replacement.sent).await?).map_err(|e| e.to_string())?;
    ensure(first["id"] == 1 && third["id"] == 3, "frames carry their stamped ids")
}

#[tokio::test]
async fn newest_handler_runs_first() -> Result<(), String> {
    let (registry, _, mut peers) = registry(RuntimeMode::Production);
    let session = registry.session(SessionOptions::new("xoxb-1")).map_err(|e| e.to_string())?;
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    for name in ["H1", "H2", "H3"] {
        let seen_tx = seen_tx.clone();
        session.on(Selector::text("deploy"), move |_message| {
            let _ = seen_tx.send(name);
        });
    }

    let peer = open(&mut peers).await?;
    peer.events.send(message_frame("C1", "please Deploy now")).map_err(|e| e.to_string())?;

    let order = vec![recv(&mut seen).await?, recv(&mut seen).await?, recv(&mut seen).await?];
    ensure(order == vec!["H3", "H2", "H1"], format!("unexpected order {order:?}"))
}

#[tokio::test]
async fn dev_channel_is_exclusive_to_development_mode() -> Result<(), String> {
    for (mode, expected) in [(RuntimeMode::Development, "C9"), (RuntimeMode::Production, "C1")] {
        let (registry, _, mut peers) = registry(mode);
        let session = registry
            .session(SessionOptions::new("xoxb-1").dev_channel("#dev"))
            .map_err(|e| e.to_string())?;
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        session.on(Selector::any(), move |message| {
            let _ = seen_tx.send(message.channel_id().unwrap_or_default().to_owned());
        });

        let peer = open(&mut peers).await?;
        for channel in ["C1", "C9", "C1", "C9"] {
            peer.events.send(message_frame(channel, "hello")).map_err(|e| e.to_string())?;
        }

        let first = recv(&mut seen).await?;
        let second = recv(&mut seen).await?;
        ensure(
            first == expected && second == expected,
            format!("{} mode dispatched {first} and {second}", mode.as_str()),
        )?;
    }
    Ok(())
}

#[tokio::test]
async fn bot_messages_reach_nobody() -> Result<(), String> {
    let (registry, _, mut peers) = registry(RuntimeMode::Production);
    let session = registry.session(SessionOptions::new("xoxb-1")).map_err(|e| e.to_string())?;
    let peer = open(&mut peers).await?;
    session.connected().await.map_err(|e| e.to_string())?;

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let listener_tx = seen_tx.clone();
    session.on(Selector::any(), move |message| {
        let _ = seen_tx.send(format!("handler {}", message.text()));
    });
    session
        .on_channel_message("#general", move |raw| {
            let _ = listener_tx.send(format!("listener {}", raw.text.as_deref().unwrap_or_default()));
        })
        .ok_or_else(|| "#general should resolve".to_owned())?;

    let bot = json!({"type": "message", "subtype": "bot_message", "channel": "C1", "text": "beep"});
    peer.events.send(StreamEvent::Frame(bot.to_string())).map_err(|e| e.to_string())?;
    peer.events.send(message_frame("C1", "human")).map_err(|e| e.to_string())?;

    ensure(recv(&mut seen).await? == "handler human", "bot message reached a handler")?;
    ensure(recv(&mut seen).await? == "listener human", "bot message reached a listener")
}

#[test]
fn names_resolve_both_ways() {
    let directory = Directory::new(snapshot());

    let by_name = directory.channel_data("#general");
    let by_id = directory.channel_data("C1");
    assert!(matches!(by_name, Some(Conversation::Channel(record)) if record.id == "C1"));
    assert_eq!(by_name, by_id);
    assert!(directory.channel_data("#missing").is_none());

    assert_eq!(directory.channel_data("@alice").map(|conversation| conversation.id()), Some("D1"));
    assert_eq!(directory.user_data("@alice").map(|user| user.id.as_str()), Some("U1"));
}

#[tokio::test]
async fn attachments_take_the_webhook_and_text_takes_the_stream() -> Result<(), String> {
    let (registry, _, mut peers) = registry(RuntimeMode::Production);
    let (posted_tx, mut posted) = mpsc::unbounded_channel();
    let notifier = Arc::new(RecordingNotifier { posted: posted_tx });
    let session = registry
        .session(SessionOptions::new("xoxb-1").webhook(WebhookSetting::Client(notifier)))
        .map_err(|e| e.to_string())?;
    let mut peer = open(&mut peers).await?;
    session.connected().await.map_err(|e| e.to_string())?;

    let route = session
        .send_message(json!({"channel": "#general", "attachments": [{"fallback": "weekly report"}]}))
        .map_err(|e| e.to_string())?;
    ensure(route == SendRoute::Webhook, "attachments should use the webhook")?;
    ensure(session.last_message_id() == 0, "webhook sends do not consume ids")?;
    let delivered = recv(&mut posted).await?;
    ensure(delivered.channel.as_deref() == Some("C1"), "webhook gets the resolved channel id")?;

    let route = session
        .send_message(json!({"channel": "#general", "text": "hi"}))
        .map_err(|e| e.to_string())?;
    ensure(route == SendRoute::Stream { id: 1 }, "plain text should use the stream")?;
    ensure(session.last_message_id() == 1, "stream send increments the counter by one")?;

    let frame: Value = serde_json::from_str(&recv(&mut peer.sent).await?).map_err(|e| e.to_string())?;
    ensure(
        frame == json!({"id": 1, "type": "message", "channel": "C1", "text": "hi"}),
        format!("unexpected frame {frame}"),
    )
}
