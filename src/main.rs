//! Pulse RTM server - real-time messaging core for the Pulse social app
//!
//! This server handles:
//! - Presence tracking over persistent WebSocket connections
//! - Message delivery with delivered/read receipts and unread counters
//! - Notification fanout for recipients not actively viewing
//! - Call signaling with ring timeout and persisted call logs

use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_rtm::config::Config;
use pulse_rtm::handlers;
use pulse_rtm::store::Store;
use pulse_rtm::AppState;

/// Pulse RTM Server CLI
#[derive(Parser)]
#[command(name = "pulse-rtm")]
#[command(about = "Real-time messaging core for the Pulse social app")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pulse_rtm=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).await?;
    let config = Arc::new(config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Starting Pulse RTM server v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(Store::new(&config.storage.database_path).await?);
    let state = AppState::new(Arc::clone(&config), store);

    let app = Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Conversations
        .route(
            "/api/v1/conversations",
            get(handlers::conversations::list_conversations)
                .post(handlers::conversations::open_conversation),
        )
        .route(
            "/api/v1/conversations/:conversation_id/messages",
            get(handlers::conversations::get_messages).post(handlers::messages::send_message),
        )
        .route(
            "/api/v1/conversations/:conversation_id/read",
            axum::routing::post(handlers::conversations::mark_read),
        )
        .route(
            "/api/v1/conversations/:conversation_id/clear",
            axum::routing::post(handlers::conversations::clear_conversation),
        )

        // Messages
        .route(
            "/api/v1/messages/:message_id",
            axum::routing::patch(handlers::messages::edit_message)
                .delete(handlers::messages::delete_message),
        )

        // WebSocket for real-time communication
        .route("/ws", get(handlers::websocket::websocket_handler))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
