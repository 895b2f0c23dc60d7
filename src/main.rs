use std::env;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mailsync::mail::imap::ImapConnector;
use mailsync::mail::types::UserKey;
use mailsync::{Config, EngineContext, EngineNotice, Pipeline, Store, Supervisor, Trigger};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailsync=debug"));

    let log_file = Config::config_dir()
        .ok()
        .map(|dir| dir.join("mailsyncd.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"mailsyncd - Background IMAP synchronization daemon

Usage: mailsyncd [command]

Commands:
    (none)      Run the sync engine until interrupted
    help        Show this help message

Configuration file: ~/.config/mailsync/config.toml
Set RUST_LOG to adjust log verbosity.
"#
    );
}

/// Stand-in for the notification collaborator.
async fn log_notices(mut notices: mpsc::UnboundedReceiver<EngineNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            EngineNotice::UnreadChanged { user } => {
                tracing::info!("Unread state changed for {}", user);
            }
            EngineNotice::NewMessage {
                user,
                mailbox_id,
                message_id,
            } => {
                tracing::info!(
                    "New message {} in mailbox {} for {}",
                    message_id,
                    mailbox_id,
                    user
                );
            }
        }
    }
}

async fn run_daemon() -> Result<()> {
    setup_logging();

    let config = Config::load()?;
    config.ensure_dirs()?;

    let database = config.database_path()?;
    let store = Store::open(&database).await?;
    tracing::info!("Opened store at {}", database.display());

    let (notices_tx, notices_rx) = mpsc::unbounded_channel();
    tokio::spawn(log_notices(notices_rx));

    let shutdown = CancellationToken::new();
    let users: Vec<UserKey> = config
        .users
        .iter()
        .map(|u| UserKey::new(u.tenant, u.user.as_str()))
        .collect();

    let ctx = EngineContext {
        store,
        connector: Arc::new(ImapConnector::new()),
        pipeline: Arc::new(Pipeline::standard(&config.filters)),
        config: Arc::new(config),
        notices: notices_tx,
        shutdown: shutdown.clone(),
    };

    let supervisor = Supervisor::new(ctx);
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let run = tokio::spawn(Arc::clone(&supervisor).run(trigger_rx));

    if users.is_empty() {
        tracing::warn!("No users configured; waiting for shutdown");
    }
    for user in users {
        tracing::info!("Scheduling sync for {}", user);
        trigger_tx.send(Trigger::user(user))?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.cancel();
    run.await?;
    tracing::info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
        None => run_daemon().await,
    }
}
