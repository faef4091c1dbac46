//! gnsmcp — MCP control-plane server for GNS3.
//!
//! Serves the tool/resource/prompt surface over stdio (default) or HTTP.
//! Startup never waits for the controller: the auth loop connects in the
//! background and tools degrade to structured unreachable errors until it
//! succeeds.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use clap::Parser;
use gns_config::{Settings, Transport};
use gnsmcp::server::McpServer;
use gnsmcp::{AppContext, lifecycle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "gnsmcp")]
#[command(about = "MCP server for GNS3 lab control")]
#[command(version)]
struct Cli {
    /// Transport: stdio or http (overrides MCP_TRANSPORT)
    #[arg(long)]
    transport: Option<Transport>,

    /// Listen host for HTTP transport (overrides MCP_LISTEN_HOST)
    #[arg(long)]
    listen_host: Option<String>,

    /// Listen port for HTTP transport (overrides MCP_LISTEN_PORT)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Log level (overrides LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(transport) = cli.transport {
        settings.transport = transport;
    }
    if let Some(host) = cli.listen_host {
        settings.listen_host = host;
    }
    if let Some(port) = cli.listen_port {
        settings.listen_port = port;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }

    // Stdout carries the protocol in stdio mode; logs always go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!(
        gns3_host = %settings.gns3.host,
        gns3_port = settings.gns3.port,
        transport = ?settings.transport,
        ssh_proxy = %settings.ssh_proxy_url,
        "starting gnsmcp"
    );

    let ctx = lifecycle::build_context(settings.clone());
    let background = lifecycle::start_background(&ctx);
    let server = Arc::new(McpServer::new(ctx.clone()));

    let result = match settings.transport {
        Transport::Stdio => run_stdio(server).await,
        Transport::Http => run_http(server, &settings.listen_host, settings.listen_port).await,
    };

    lifecycle::shutdown(&ctx, background).await;
    result
}

// ─── stdio transport ──────────────────────────────────────────────────────────

/// Newline-delimited JSON-RPC over stdio. Each request runs as its own
/// task; a writer task serializes access to stdout.
async fn run_stdio(server: Arc<McpServer>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let server = server.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = server.handle_raw(&line).await {
                let _ = tx.send(response).await;
            }
        });
    }

    info!("stdin closed, shutting down");
    drop(tx);
    let _ = writer.await;
    Ok(())
}

// ─── HTTP transport ───────────────────────────────────────────────────────────

async fn run_http(server: Arc<McpServer>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/healthz", get(healthz))
        .with_state(server);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gnsmcp listening (http)");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "signal handler failed");
            }
        })
        .await?;
    Ok(())
}

async fn mcp_endpoint(State(server): State<Arc<McpServer>>, body: String) -> impl IntoResponse {
    match server.handle_raw(&body).await {
        Some(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            response,
        )
            .into_response(),
        // Notifications carry no response body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn healthz(State(server): State<Arc<McpServer>>) -> impl IntoResponse {
    let ctx: &Arc<AppContext> = server.context();
    let client = ctx.registry.get::<gns_client::Gns3Client>();
    axum::Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "gns3_connection": client.connection_state().label(),
    }))
}
