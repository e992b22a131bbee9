use botrally_server::api::{self, AppState, InMemoryBotStore};
use botrally_server::config::ServerConfig;
use botrally_server::lobby_manager::LobbyManager;
use botrally_server::registry::SessionRegistry;
use botrally_server::track::{StageFactory, TrackFactory};
use clap::Parser;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to server.toml configuration file
    #[arg(short, long, default_value = "./server.toml")]
    config: String,

    /// Override log level (trace|debug|info|warn|error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = ServerConfig::load_or_default(&args.config);
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    info!("Starting BotRally Server v0.1.0");
    info!("Configuration loaded from: {}", args.config);
    info!("Bind: {}", config.server.bind);
    info!(
        "Tick rate: {}Hz, bot tick rate: {}Hz",
        config.game.tick_rate, config.game.bot_tick_rate
    );

    let track_factory: Arc<dyn TrackFactory> = Arc::new(StageFactory::default());
    let lobby_manager = Arc::new(LobbyManager::new(Arc::clone(&track_factory)));
    let registry = Arc::new(SessionRegistry::new(config.clone()));
    let bot_store = Arc::new(InMemoryBotStore::default());

    let state = AppState {
        config: Arc::new(config.clone()),
        lobby_manager: Arc::clone(&lobby_manager),
        registry,
        bot_store,
        track_factory,
        lobby_hub: Arc::new(api::LobbyHub::default()),
    };

    // Periodic sweep of abandoned lobbies.
    let sweeper_manager = Arc::clone(&lobby_manager);
    let max_age = config.server.lobby_max_age_secs;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let swept = sweeper_manager.cleanup_stale_lobbies(max_age).await;
            if swept > 0 {
                info!(swept, "stale lobbies removed");
            }
        }
    });

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("Server is running. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Shutdown signal received. Cleaning up...");
        })
        .await?;

    Ok(())
}
