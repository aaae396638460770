use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bankline_client::config::{CliConfig, ClientConfig, FileConfig};
use bankline_client::notifications::{FeedState, NotificationCenter, NotificationsApi};
use bankline_client::token::{StaticTokenSource, TokenSource};
use bankline_client::transport::Connector;

#[derive(Parser, Debug)]
#[clap(
    name = "bankline-notify",
    about = "Tail your Bankline notifications from a terminal."
)]
struct CliArgs {
    /// Base URL of the Bankline backend, e.g. https://bank.example
    #[clap(long)]
    pub base_url: Option<String>,

    /// Bearer token for the session.
    #[clap(long)]
    pub token: Option<String>,

    /// Path to a file containing the bearer token.
    #[clap(long)]
    pub token_file: Option<PathBuf>,

    /// Path to a TOML config file. TOML values override CLI values.
    #[clap(long)]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };

    let token = match (&cli_args.token, &cli_args.token_file) {
        (Some(token), _) => Some(token.clone()),
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read token file {:?}", path))?;
            Some(raw.trim().to_string())
        }
        (None, None) => None,
    };

    let cli = CliConfig {
        base_url: cli_args.base_url.clone(),
        token,
    };
    let config = ClientConfig::resolve(&cli, file_config)?;

    let token = config.token.clone().context(
        "A bearer token is required via --token, --token-file or the config file",
    )?;
    let tokens: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new(token));

    info!("bankline-notify {} starting", env!("GIT_HASH"));
    info!("Backend at {}", config.base_url);

    let connector = Connector::new(config.connector_config(), tokens.clone());
    let api = NotificationsApi::new(config.api_url(), tokens.clone())?;
    let center = NotificationCenter::new(connector, api, tokens, config.refresh_interval());

    center.start().await?;
    if !center.is_active() {
        warn!("This token has no notification queue, nothing to tail");
        return Ok(());
    }

    print_feed(&center.feed(), &mut HashSet::new());

    let mut feed = center.watch_feed();
    let mut printed: HashSet<String> = center
        .feed()
        .notifications
        .iter()
        .map(|n| n.id.clone())
        .collect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = feed.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = feed.borrow_and_update().clone();
                print_feed(&state, &mut printed);
            }
        }
    }

    info!("Shutting down");
    center.stop().await;
    Ok(())
}

/// Print notifications not shown yet, newest last so the terminal tails.
fn print_feed(state: &FeedState, printed: &mut HashSet<String>) {
    for notification in state.notifications.iter().rev() {
        if !printed.insert(notification.id.clone()) {
            continue;
        }
        let marker = if notification.read { " " } else { "*" };
        let timestamp = notification
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{marker} [{timestamp}] {} - {}",
            notification.title, notification.content
        );
    }
}
