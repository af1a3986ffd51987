use clap::Parser;
use log::{error, info};
use server::config::Config;
use server::coordinator::VetoCoordinator;
use server::launch::{run_launch_worker, Launcher};
use server::lobby::LobbyService;
use server::network::Server;
use server::store::MemoryStore;
use server::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Seconds a team has to ban before the watchdog bans for it
    #[arg(long, default_value = "40")]
    turn_window_secs: u64,

    #[arg(long, default_value = "1000")]
    watchdog_interval_ms: u64,

    #[arg(long, default_value = "15")]
    heartbeat_secs: u64,

    #[arg(long, default_value = "5")]
    rcon_timeout_secs: u64,

    /// Connect password for lobbies that do not set one
    #[arg(long, default_value = "scrim")]
    connect_password: String,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "256")]
    max_clients: usize,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            bind_addr: format!("{}:{}", args.host, args.port),
            turn_window: Duration::from_secs(args.turn_window_secs),
            watchdog_interval: Duration::from_millis(args.watchdog_interval_ms.max(1)),
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
            rcon_timeout: Duration::from_secs(args.rcon_timeout_secs),
            default_connect_password: args.connect_password,
            max_clients: args.max_clients,
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from(Args::parse());
    info!("Starting scrim coordinator on {}", config.bind_addr);

    let store = Arc::new(MemoryStore::new());
    let (launch_tx, launch_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();

    let coordinator = Arc::new(VetoCoordinator::new(
        store.clone(),
        config.turn_window,
        launch_tx,
    ));

    let launcher_handle = tokio::spawn(run_launch_worker(
        launch_rx,
        store.clone(),
        Launcher::new(config.rcon_timeout),
        config.default_connect_password.clone(),
    ));

    let watchdog = Watchdog::new(
        Arc::clone(&coordinator),
        config.watchdog_interval,
        config.heartbeat_interval,
    );
    let watchdog_handle = tokio::spawn(watchdog.run(notice_tx));

    let mut server = Server::new(&config, coordinator, LobbyService::new(store), notice_rx).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Coordinator stopped with error: {}", e);
            }
        }
        result = watchdog_handle => {
            if let Err(e) = result {
                error!("Watchdog task panicked: {}", e);
            }
        }
        result = launcher_handle => {
            if let Err(e) = result {
                error!("Launch worker panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
