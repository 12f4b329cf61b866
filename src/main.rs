//! `cryomag` binary: the event server or one of the two coordinators.
//!
//! ```bash
//! # central server (event bus, dispatcher, HTTP surface)
//! cryomag --config cryomag.toml server
//!
//! # on the fridge machine
//! cryomag cryo
//!
//! # on the magnetometry bench
//! cryomag magnetism
//!
//! # show defaults merged with the file and CRYOMAG_* variables
//! cryomag print-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cryomag_daq::config::Settings;
use cryomag_daq::coordinator::{run_client, CryoCoordinator, EventHandler, MagnetismCoordinator};
use cryomag_daq::logging::init_tracing;
use cryomag_daq::protocol::{ClientIdentity, Role};
use cryomag_daq::server::{serve_http, HttpState, Server};
use cryomag_daq::station::{CryoStation, MagnetismStation};
use cryomag_daq::storage::Database;
use cryomag_daq::transport::tcp::accept_loop;
use cryomag_daq::transport::{ClientLink, Connector, TcpConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "cryomag",
    version = env!("CARGO_PKG_VERSION"),
    about = "Step-sequenced cryogenics and magnetometry acquisition"
)]
struct Cli {
    /// Configuration file (defaults to ./cryomag.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the event server, step dispatcher and HTTP surface.
    Server,
    /// Run the cryogenics coordinator.
    Cryo,
    /// Run the magnetism coordinator.
    Magnetism,
    /// Print the effective configuration as TOML and exit.
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Command::PrintConfig = cli.command {
        print!("{}", toml::to_string_pretty(&settings).context("rendering configuration")?);
        return Ok(());
    }
    init_tracing(&settings.application)?;

    match cli.command {
        Command::Server => run_server(&settings).await,
        Command::Cryo => {
            let link = client_link(&settings, Role::Cryo);
            let station = Arc::new(CryoStation::simulated(&settings));
            let coordinator = CryoCoordinator::start(station, link.clone(), &settings);
            run_coordinator(&settings, link, Arc::new(coordinator)).await
        }
        Command::Magnetism => {
            let link = client_link(&settings, Role::Magnetism);
            let station = Arc::new(MagnetismStation::simulated(&settings));
            let coordinator = MagnetismCoordinator::start(station, link.clone(), &settings);
            run_coordinator(&settings, link, Arc::new(coordinator)).await
        }
        Command::PrintConfig => Ok(()),
    }
}

async fn run_server(settings: &Settings) -> Result<()> {
    let db = Database::open(settings.server.database_path.clone())
        .with_context(|| format!("opening {}", settings.server.database_path.display()))?;

    let event_listener = TcpListener::bind(&settings.server.event_addr)
        .await
        .with_context(|| format!("binding event bus on {}", settings.server.event_addr))?;
    let http_listener = TcpListener::bind(&settings.server.http_addr)
        .await
        .with_context(|| format!("binding http surface on {}", settings.server.http_addr))?;

    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let server = Server::start_with_limit(db.clone(), accept_rx, settings.server.max_sweep_steps);
    let state = HttpState::with_index_file(db, server.handle(), &settings.server.index_page);
    info!(
        event_addr = %settings.server.event_addr,
        http_addr = %settings.server.http_addr,
        "server running, press Ctrl-C to stop"
    );

    tokio::select! {
        result = accept_loop(event_listener, accept_tx) => result.context("event bus listener failed")?,
        result = serve_http(http_listener, state) => result.context("http surface failed")?,
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C, shutting down"),
    }

    server.shutdown().await;
    Ok(())
}

fn client_link(settings: &Settings, role: Role) -> ClientLink {
    let identity = ClientIdentity::local(role, settings.client.hardware_id.as_deref());
    ClientLink::new(identity, settings.client.reconnect_timeout())
}

async fn run_coordinator<H>(settings: &Settings, link: ClientLink, handler: Arc<H>) -> Result<()>
where
    H: EventHandler + 'static,
{
    let connector: Arc<dyn Connector> =
        Arc::new(TcpConnector::new(settings.client.server_addr.clone()));
    info!(identity = %link.identity(), server = %connector.describe(), "coordinator running");

    let client = tokio::spawn(run_client(
        connector,
        link,
        handler,
        settings.client.reconnect_delay(),
    ));
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C, shutting down");
    client.abort();
    Ok(())
}
