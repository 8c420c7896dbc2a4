//! Lending gateway - JSON-over-HTTP front end for the lending engine.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use lending::context::LendingContext;
use lending::io::config::load_config;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "lending-gateway")]
#[command(about = "HTTP gateway for the lending inventory")]
struct Args {
    /// Path to the TOML configuration
    #[arg(long, default_value = "lending.toml")]
    config: PathBuf,

    /// Address to bind the server to (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lending_gateway=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    info!(config = %args.config.display(), "starting lending-gateway");

    let ctx = LendingContext::open(config)?;
    let state = AppState::new(ctx.engine().clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::api_router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let gateway = &ctx.config().gateway;
    let addr: SocketAddr = format!("{}:{}", gateway.bind, gateway.port)
        .parse()
        .context("parse bind address")?;
    info!(addr = %addr, "listening");

    let listener = TcpListener::bind(addr).await?;
    serve(ctx, listener, app, shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then flush the context. The snapshot is
/// written even when serving fails; the serve error is reported after it.
async fn serve<F>(
    ctx: LendingContext,
    listener: TcpListener,
    app: Router,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    ctx.shutdown()?;
    served.context("serve http")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
