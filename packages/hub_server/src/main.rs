use anyhow::{Context, Result};
use clap::Parser;
use group_hub::{CLOSE_GOING_AWAY, format_close_message};
use hub_server::{
    AppState,
    config::{FileConfig, HubConfig, load_config},
    router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser, Debug)]
#[command(name = "hub-server")]
#[command(about = "Group broadcast hub over WebSockets")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "hub.toml")]
    config: PathBuf,

    /// Host to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "hub_server=debug,group_hub=debug,tower_http=debug,info"
    } else {
        "hub_server=info,group_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(&args.config)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", args.config))?;
    let mut config = HubConfig::from_file(&file_config);
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;

    info!(
        ttl_secs = config.ttl.as_secs(),
        tick_secs = config.tick.as_secs(),
        idle_check_secs = config.worker.idle_interval.as_secs(),
        grace_secs = config.worker.grace.as_secs(),
        "Starting group hub"
    );

    let state = AppState::new(config);
    let hub = state.hub.clone();

    let app = router(state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Listening on http://{}", actual_addr);
    info!("  GET /ws/{{group}}  - join group (WebSocket)");
    info!("  GET /mon           - sessions and workers");
    info!("  GET /health        - health status");
    info!("  GET /metrics       - counters");

    let shutdown_hub = hub.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received shutdown signal, closing connections...");
        // Sockets must see their close frame before the server drains them.
        let payload = format_close_message(CLOSE_GOING_AWAY, "server shutting down");
        if let Err(e) = shutdown_hub.close_with_msg(&payload).await {
            warn!("Failed to close hub: {}", e);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
