mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use beach_call::EndpointId;
use beach_call::config::Config;
use beach_call::media::source::StaticMediaSource;
use beach_call::media::webrtc_engine::WebRtcMediaEngine;
use beach_call::permission::StaticPermissionGate;
use beach_call::session::{CallController, CallDeps};
use beach_call::signaling::SignalingChannel;
use beach_call::transport::MailboxTransport;
use beach_call::transport::websocket::WebSocketMailbox;
use cli::{HELP, LineCommand, describe_notice, describe_snapshot};

#[derive(Parser, Debug)]
#[command(name = "beach-call", about = "One-to-one calls over a beach mailbox")]
struct Cli {
    /// Mailbox name for this endpoint (generated when omitted)
    #[arg(long, env = "BEACH_CALL_ENDPOINT")]
    endpoint: Option<String>,

    /// Base URL of the beach-mailbox relay
    #[arg(long, env = "BEACH_CALL_MAILBOX_URL")]
    mailbox: Option<String>,

    /// Use the Redis stream mailbox at this URL instead of the relay
    #[cfg(feature = "redis-mailbox")]
    #[arg(long, env = "BEACH_CALL_REDIS_URL")]
    redis: Option<String>,

    /// Let unanswered incoming calls expire after this many seconds
    #[arg(long)]
    ring_timeout: Option<u64>,

    /// Host candidates only; skip public STUN
    #[arg(long)]
    localhost_only: bool,

    /// Refuse camera/microphone access
    #[arg(long)]
    deny_media: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "warn");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = apply_cli(Config::from_env(), &cli)?;

    let transport = connect_transport(&config).await?;
    let signaling = Arc::new(SignalingChannel::new(transport, config.reconnect_policy()));
    let engine = Arc::new(WebRtcMediaEngine::new().context("initialising media engine")?);
    let controller = CallController::spawn(
        CallDeps {
            signaling,
            engine,
            media: Arc::new(StaticMediaSource::default()),
            permissions: Arc::new(StaticPermissionGate::new(config.auto_grant_permissions)),
        },
        config.call_settings(),
    );

    println!("endpoint {} ready; {HELP}", controller.local_id());
    let printer = tokio::spawn(print_updates(controller.observer()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match LineCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        let result = match command {
            LineCommand::Call(peer) => controller.call(peer).await,
            LineCommand::Accept => controller.accept_call().await,
            LineCommand::Reject => controller.reject_call().await,
            LineCommand::End => controller.end_call().await,
            LineCommand::Mute(muted) => controller.set_muted(muted).await,
            LineCommand::Video(enabled) => controller.set_video_enabled(enabled).await,
            LineCommand::SwitchCamera => controller.switch_camera().await,
            LineCommand::Status => {
                println!("{}", describe_snapshot(&controller.snapshot()));
                Ok(())
            }
            LineCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            LineCommand::Quit => break,
        };
        if let Err(err) = result {
            println!("error: {err}");
        }
    }

    controller.shutdown().await;
    // Give the printer a moment to flush the final transition.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    Ok(())
}

fn apply_cli(mut config: Config, cli: &Cli) -> Result<Config> {
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint_id = EndpointId::new(endpoint.clone()).context("invalid --endpoint")?;
    }
    if let Some(mailbox) = &cli.mailbox {
        config.mailbox_url = mailbox.clone();
    }
    #[cfg(feature = "redis-mailbox")]
    if let Some(redis) = &cli.redis {
        config.redis_url = Some(redis.clone());
    }
    if let Some(secs) = cli.ring_timeout {
        config.incoming_call_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    config.localhost_only |= cli.localhost_only;
    if cli.deny_media {
        config.auto_grant_permissions = false;
    }
    Ok(config)
}

async fn connect_transport(config: &Config) -> Result<Arc<dyn MailboxTransport>> {
    #[cfg(feature = "redis-mailbox")]
    if let Some(redis_url) = &config.redis_url {
        let mailbox = beach_call::transport::redis_log::RedisMailbox::connect(
            redis_url,
            config.endpoint_id.clone(),
            config.reconnect_policy(),
        )
        .await
        .with_context(|| format!("connecting to redis mailbox at {redis_url}"))?;
        return Ok(mailbox);
    }

    let mailbox = WebSocketMailbox::connect(
        &config.mailbox_url,
        config.endpoint_id.clone(),
        config.reconnect_policy(),
    )
    .await
    .with_context(|| format!("connecting to mailbox relay at {}", config.mailbox_url))?;
    Ok(mailbox)
}

async fn print_updates(observer: beach_call::session::SessionObserver) {
    let mut snapshots = observer.watch();
    let mut notices = observer.notices();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", describe_snapshot(&snapshot));
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", describe_notice(&notice)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}
