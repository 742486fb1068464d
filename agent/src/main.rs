//! GeoPresence agent
//!
//! Watches live positions from the hub, sends your own, or lists users.
//! Endpoints come from `PRESENCE_HUB_URL` and `PRESENCE_API_BASE_URL`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use geopresence_core::{
    drive_renderer, ConnectionState, PresenceBridge, PresenceConfig, PresenceView, TextRenderer, UserDirectory,
};
use geopresence_env::{TokioContext, WsConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type Bridge = PresenceBridge<TokioContext, WsConnector>;

#[derive(Parser, Debug)]
#[command(name = "geopresence-agent")]
#[command(about = "Real-time presence client for the GeoPresence hub", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render live positions until ctrl-c
    Watch {
        /// Minimum milliseconds between redraws (0 = every change)
        #[arg(long, default_value = "250")]
        throttle_ms: u64,
    },
    /// Publish one position and exit
    Send {
        #[arg(long)]
        identity: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Seconds to wait for the hub before giving up
        #[arg(long, default_value = "15")]
        timeout_secs: u64,
    },
    /// Print one page of the user directory
    Users {
        #[arg(long, default_value = "10")]
        take: u32,
        #[arg(long, default_value = "0")]
        skip: u32,
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;

    let config = PresenceConfig::from_env().context("invalid GeoPresence configuration")?;
    info!(hub = %config.hub_url, api = %config.api_base_url, "configuration loaded");

    match args.command {
        Command::Watch { throttle_ms } => watch_positions(&config, throttle_ms).await,
        Command::Send {
            identity,
            lat,
            lon,
            timeout_secs,
        } => send(&config, &identity, lat, lon, Duration::from_secs(timeout_secs)).await,
        Command::Users { take, skip, json } => users(&config, take, skip, json).await,
    }
}

fn bridge(config: &PresenceConfig) -> Bridge {
    PresenceBridge::new(
        TokioContext::shared(),
        Arc::new(WsConnector::new(config.negotiate.clone())),
        Arc::new(config.reconnect_policy()),
        config.hub.clone(),
    )
}

async fn watch_positions(config: &PresenceConfig, throttle_ms: u64) -> Result<()> {
    let bridge = bridge(config);
    let views = bridge.subscribe();
    bridge.activate(config.hub_url.as_str())?;

    let throttle = (throttle_ms > 0).then(|| Duration::from_millis(throttle_ms));
    let mut renderer = TextRenderer::new(std::io::stdout());

    tokio::select! {
        renders = drive_renderer(views, &mut renderer, throttle) => {
            info!(renders, "view publisher closed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("shutting down");
        }
    }

    bridge.deactivate();
    Ok(())
}

async fn send(config: &PresenceConfig, identity: &str, lat: f64, lon: f64, timeout: Duration) -> Result<()> {
    let bridge = bridge(config);
    let mut views = bridge.subscribe();
    bridge.activate(config.hub_url.as_str())?;

    tokio::time::timeout(timeout, wait_for_connection(&mut views))
        .await
        .context("timed out waiting for the hub")??;

    let result = bridge.send(identity, lat, lon).await;
    bridge.deactivate();
    result.with_context(|| format!("sending position for {identity}"))?;

    info!(identity, lat, lon, "position sent");
    Ok(())
}

async fn wait_for_connection(views: &mut watch::Receiver<PresenceView>) -> Result<()> {
    loop {
        let state = views.borrow_and_update().state;
        match state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => bail!("hub connection failed"),
            _ => {}
        }
        views.changed().await.context("presence bridge went away")?;
    }
}

async fn users(config: &PresenceConfig, take: u32, skip: u32, json: bool) -> Result<()> {
    let directory = UserDirectory::new(config.api_base_url.clone());
    let users = directory
        .fetch_page(take, skip)
        .await
        .with_context(|| format!("fetching users take={take} skip={skip}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }

    for user in &users {
        println!(
            "{:>5}  {:<28} {:<32} {} @ {}",
            user.id,
            user.full_name(),
            user.email,
            user.company.title,
            user.company.name
        );
    }
    info!(count = users.len(), "users fetched");
    Ok(())
}
