use std::sync::{Arc, Weak};

use anyhow::Context;
use chatterbox_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use chatterbox_slack::{
    HttpBootstrapper, Message, OutboundMessage, Selector, Session, SessionOptions,
    SessionRegistry, WebSocketConnector,
};
use tracing::{info, warn, Level};

use super::{CommandResult, EXIT_SESSION};

const COMMAND: &str = "run";

pub async fn run(options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return CommandResult::config_failure(COMMAND, &error),
    };
    init_logging(&config.logging);

    match serve(&config).await {
        Ok(summary) => CommandResult::success(COMMAND, summary),
        Err(error) => CommandResult::failure(COMMAND, "session", format!("{error:#}"), EXIT_SESSION),
    }
}

fn init_logging(logging: &LoggingConfig) {
    let level = logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt().with_target(false).with_max_level(level);

    let installed = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(error) = installed {
        eprintln!("tracing subscriber not installed: {error}");
    }
}

async fn serve(config: &AppConfig) -> anyhow::Result<String> {
    let bootstrapper = HttpBootstrapper::new(config.slack.api_base_url.clone())?;
    let registry = SessionRegistry::new(
        Arc::new(bootstrapper),
        Arc::new(WebSocketConnector),
        config.runtime.mode,
    );

    let session = registry.session(SessionOptions::from_config(&config.slack))?;
    register_ping(&session)?;

    session.connected().await.context("session did not become ready")?;
    let directory = session.directory();
    info!(
        event_name = "system.cli.session_ready",
        bot = session.name().as_deref().unwrap_or("unknown"),
        mode = session.mode().as_str(),
        dev_channel = session.dev_channel().unwrap_or("none"),
        im_prefix = session.im_prefix().unwrap_or("none"),
        channels = directory.snapshot().map_or(0, |snapshot| snapshot.channels.len()),
        webhook = session.has_webhook(),
        "session ready; answering ping"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!(event_name = "system.cli.shutdown", "ctrl-c received; shutting down");
            Ok(format!("stopped after {} outbound messages", session.last_message_id()))
        }
        () = session.closed() => {
            warn!(event_name = "system.cli.stream_closed", "streaming connection closed");
            anyhow::bail!(
                "streaming connection closed after {} outbound messages",
                session.last_message_id()
            )
        }
    }
}

/// Answers an addressed `ping` in the channel it came from.
fn register_ping(session: &Arc<Session>) -> anyhow::Result<()> {
    let selector = Selector::pattern(r"(?i)^ping\b")?.addressed();
    let handle: Weak<Session> = Arc::downgrade(session);

    session.on(selector, move |message: &Message| {
        let (Some(session), Some(channel)) = (handle.upgrade(), message.channel_id()) else {
            return;
        };
        if let Err(error) = session.send_message(OutboundMessage::new(channel, "pong")) {
            warn!(event_name = "egress.cli.pong_failed", error = %error, "could not answer ping");
        }
    });
    Ok(())
}
