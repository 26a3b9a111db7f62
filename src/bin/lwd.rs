//! livewatch daemon - go-live notifications for tracked channels
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon (foreground)
//! lwd run --config ~/.config/livewatch/config.toml
//!
//! # Print the URL an operator visits to enable push delivery
//! lwd authorize-url
//!
//! # Store the user credential for the code returned by that URL;
//! # a running daemon picks it up on SIGHUP
//! lwd authorize <code>
//!
//! # Show tracked channels
//! lwd list
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lw_core::Handle;
use lwd::api::TokenExchange;
use lwd::config::DaemonConfig;
use lwd::credentials::{CredentialManager, CredentialStore};
use lwd::notify::{LogNotifier, Notifier, TelegramNotifier};
use lwd::poller::{spawn_poll_task, Poller};
use lwd::push::{PushConfig, PushPipeline, WsDialer, DEFAULT_ENDPOINT};
use lwd::registry::{ChannelRegistry, SnapshotStore};
use lwd::service::{spawn_reassignment_task, ServiceError, WatchService};
use lwd::twitch::{http_client, HelixClient, TwitchAuth};

/// livewatch daemon - channel go-live notifier
#[derive(Parser, Debug)]
#[command(name = "lwd", version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, global = true, env = "LIVEWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Exchange an authorization code for the user credential
    Authorize {
        /// Code returned to the redirect URI
        code: String,
    },
    /// Print the user authorization URL
    AuthorizeUrl,
    /// List tracked channels
    List,
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("livewatch").join("config.toml");
    path.exists().then_some(path)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("livewatch")
}

fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig> {
    let path = path.or_else(default_config_path);
    let mut config = DaemonConfig::load(path.as_deref())
        .context("Failed to load configuration")?
        .with_default_data_dir(default_data_dir());
    config.apply_env().context("Invalid environment override")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lwd=info".parse()?)
                .add_directive("lw_core=info".parse()?)
                .add_directive("lw_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

fn twitch_auth(config: &DaemonConfig, http: reqwest::Client) -> TwitchAuth {
    match config.endpoints.auth_base.as_deref() {
        Some(base) => TwitchAuth::with_base_url(http, config.app_credentials(), base),
        None => TwitchAuth::new(http, config.app_credentials()),
    }
}

fn credential_manager(config: &DaemonConfig, http: reqwest::Client) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::new(
        Arc::new(twitch_auth(config, http)),
        CredentialStore::new(config.user_token_path()),
    ))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    let config = load_config(args.config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config),
        Command::Authorize { code } => authorize(config, &code),
        Command::AuthorizeUrl => {
            let http = http_client().context("Failed to build HTTP client")?;
            println!("{}", twitch_auth(&config, http).authorization_url());
            Ok(())
        }
        Command::List => list(&config),
    }
}

#[tokio::main]
async fn authorize(config: DaemonConfig, code: &str) -> Result<()> {
    let http = http_client().context("Failed to build HTTP client")?;
    let credentials = credential_manager(&config, http);

    credentials
        .complete_authorization(code)
        .await
        .context("Authorization failed")?;

    println!(
        "User credential stored in {}",
        config.user_token_path().display()
    );
    println!("Send SIGHUP to a running daemon to pick it up.");
    Ok(())
}

fn list(config: &DaemonConfig) -> Result<()> {
    // Read-only: a running daemon owns the snapshot
    let records = SnapshotStore::new(config.registry_path())
        .read_only()
        .context("Failed to read channel registry")?;

    if records.is_empty() {
        println!("No channels tracked.");
        return Ok(());
    }

    println!(
        "{:<26} {:<8} {:<6} {:<8} LAST CHECKED",
        "HANDLE", "PRIORITY", "MODE", "STATUS"
    );
    for record in records {
        println!(
            "{:<26} {:<8} {:<6} {:<8} {}",
            record.handle,
            record.priority,
            record.delivery_mode,
            if record.is_live { "live" } else { "offline" },
            record.last_checked.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    Ok(())
}

/// Runs the daemon until SIGINT or SIGTERM.
#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "livewatch daemon starting"
    );
    debug!(?config, "Configuration loaded");

    let cancel_token = CancellationToken::new();

    let http = http_client().context("Failed to build HTTP client")?;
    let credentials = credential_manager(&config, http.clone());

    let helix = Arc::new(match config.endpoints.api_base.as_deref() {
        Some(base) => HelixClient::with_base_url(http.clone(), &config.client_id, credentials.clone(), base),
        None => HelixClient::new(http.clone(), &config.client_id, credentials.clone()),
    });

    let registry = Arc::new(
        ChannelRegistry::open(config.registry_path()).context("Failed to open channel registry")?,
    );

    let notifier: Arc<dyn Notifier> = match &config.telegram {
        Some(telegram) => Arc::new(TelegramNotifier::new(
            http.clone(),
            telegram.bot_token.clone(),
            telegram.chat_id,
        )),
        None => {
            warn!("No Telegram target configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let push_config = PushConfig {
        endpoint: config
            .endpoints
            .eventsub_url
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        ..PushConfig::default()
    };

    let push = PushPipeline::new(
        registry.clone(),
        credentials.clone(),
        helix.clone(),
        helix.clone(),
        notifier.clone(),
        Arc::new(WsDialer::new()),
        push_config,
        cancel_token.clone(),
    );

    let service = Arc::new(WatchService::new(
        registry.clone(),
        credentials.clone(),
        helix.clone(),
        helix.clone(),
        push.clone(),
        config.push_capacity,
    ));

    seed_channels(&service, &config).await;

    if !credentials.has_valid_user_credential().await {
        warn!(
            url = %service.authorization_url(),
            "User authorization required; push channels are not watched until then"
        );
    }

    let reassignment_handle = spawn_reassignment_task(
        service.clone(),
        config.polling_interval(),
        cancel_token.clone(),
    );

    let poller = Arc::new(Poller::new(registry.clone(), helix.clone(), notifier.clone()));
    let poll_handle = spawn_poll_task(poller, config.polling_interval(), cancel_token.clone());

    let status = service.status().await;
    info!(
        tracked = status.tracked,
        push = status.assignment.push,
        pull = status.assignment.pull,
        capacity = status.push_capacity,
        "livewatch daemon running"
    );

    if let Err(e) = wait_for_shutdown_signal(&service).await {
        error!(error = %e, "Error waiting for shutdown signal");
    }
    info!("Shutdown signal received");

    cancel_token.cancel();
    push.disconnect().await;

    for (name, handle) in [("reassignment", reassignment_handle), ("poller", poll_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }

    info!("livewatch daemon stopped");
    Ok(())
}

/// Tracks the configured channels that the registry does not hold yet.
async fn seed_channels(service: &WatchService, config: &DaemonConfig) {
    for seed in &config.channels {
        if let Ok(handle) = Handle::parse(&seed.handle) {
            if service.registry().get(&handle).await.is_some() {
                continue;
            }
        }

        match service.add_channel(&seed.handle, seed.priority).await {
            Ok(record) => info!(handle = %record.handle, "Seeded channel from config"),
            Err(ServiceError::AlreadyTracked(handle)) => {
                debug!(handle = %handle, "Seed channel already tracked");
            }
            Err(e) => warn!(handle = %seed.handle, error = %e, "Failed to seed channel"),
        }
    }
}

/// Waits for SIGTERM or SIGINT. SIGHUP reloads the user credential.
async fn wait_for_shutdown_signal(service: &WatchService) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    let authorized = service.reload_authorization().await;
                    info!(authorized, "Received SIGHUP, user credential reloaded");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = service;
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
