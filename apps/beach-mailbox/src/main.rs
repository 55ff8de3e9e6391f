use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beach_mailbox::MailboxState;
use beach_mailbox::config::Config;

#[derive(Parser, Debug)]
#[command(name = "beach-mailbox", about = "Mailbox relay for beach-call endpoints")]
struct Cli {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Messages held per offline endpoint
    #[arg(long)]
    max_pending: Option<usize>,
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
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max_pending) = cli.max_pending {
        config.max_pending = max_pending;
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, max_pending = config.max_pending, "beach-mailbox listening");

    beach_mailbox::serve(listener, MailboxState::new(config.max_pending))
        .await
        .context("serving mailbox relay")
}
