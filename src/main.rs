//! Brickyard
//!
//! Pending-operation engine for clustered brick storage.
//!
//! ```text
//!   brickyard serve     stale gate ─▶ cleaner loop + /healthz /readyz /metrics /pending
//!   brickyard cleanup   mark stale ─▶ one clean pass ─▶ JSON report
//!   brickyard pending   JSON list of pending operations and their problems
//! ```

use anyhow::Context;
use brickyard::config::{Config, ExecutorKind};
use brickyard::executor;
use brickyard::{Cleaner, Metrics, OperationContext, OperationManager, StorageCommands, Store};
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Brickyard - pending-operation engine for clustered brick storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, env = "BRICKYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Store file, overrides the configuration file
    #[arg(long, env = "BRICKYARD_DB")]
    db: Option<PathBuf>,

    /// Use the in-memory simulated cluster instead of running commands
    #[arg(long, env = "BRICKYARD_FAKE_EXECUTOR")]
    fake_executor: bool,

    /// Start even when stale pending operations exist
    #[arg(long, env = "BRICKYARD_IGNORE_STALE_OPERATIONS")]
    ignore_stale_operations: bool,

    /// Minimum log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background cleaner and the health and metrics endpoints
    Serve {
        /// Health and metrics server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
        health_addr: String,
    },
    /// Mark every pending operation stale and clean them once
    Cleanup,
    /// Print pending operations with any inconsistencies found
    Pending,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting Brickyard");
    info!("  Store: {:?}", config.store.path);
    info!("  Executor: {:?}", config.executor.kind);
    info!("  Max in-flight operations: {}", config.operations.max_inflight);

    let store = Store::from_config(&config.store).context("opening store")?;
    let executor = executor::from_config(&config).context("creating executor")?;
    let commands = StorageCommands::new(executor, config.executor.clone());
    let metrics =
        Metrics::new(prometheus::default_registry()).context("registering metrics")?;
    let ctx = OperationContext::new(store, &config.operations);
    let manager = OperationManager::new(ctx, commands, metrics);

    match args.command {
        Command::Serve { health_addr } => serve(config, manager, health_addr).await,
        Command::Cleanup => {
            let marked = manager.mark_pending_stale()?;
            let report = manager.clean_pending().await?;
            info!(
                marked,
                cleaned = report.cleaned,
                failed = report.failed,
                skipped = report.skipped,
                "cleanup finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 {
                anyhow::bail!("{} pending operations could not be cleaned", report.failed);
            }
            Ok(())
        }
        Command::Pending => {
            let report = manager.pending_report()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(db) = &args.db {
        config.store.path = Some(db.clone());
    }
    if args.fake_executor {
        config.executor.kind = ExecutorKind::Fake;
    }
    if args.ignore_stale_operations {
        config.operations.ignore_stale_operations = true;
    }
    config.validate()?;
    Ok(config)
}

async fn serve(
    config: Config,
    manager: Arc<OperationManager>,
    health_addr: String,
) -> anyhow::Result<()> {
    let stale = manager.check_stale()?;
    if stale > 0 {
        warn!(stale, "starting with stale pending operations");
    }

    let cancel = CancellationToken::new();
    let cleaner = Cleaner::new(manager.clone(), config.cleaner.clone());
    let cleaner_handle = tokio::spawn(cleaner.run(cancel.clone()));

    let server_manager = manager.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, server_manager).await {
            error!(error = %e, "health server stopped");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    server.abort();
    if let Err(e) = cleaner_handle.await {
        error!("Cleaner task failed: {}", e);
    }
    if manager.inflight_count() > 0 {
        warn!(
            inflight = manager.inflight_count(),
            "exiting with operations in flight"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level: Level = args.log_level.parse().unwrap_or(Level::INFO);
    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

// =============================================================================
// Health, Metrics and Pending Endpoints
// =============================================================================

type Body = Full<Bytes>;

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn metrics_page() -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut page = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut page) {
        return reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    let mut response = reply(StatusCode::OK, page);
    if let Ok(value) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn pending_page(manager: &OperationManager) -> Response<Body> {
    let body = manager
        .pending_report()
        .map_err(anyhow::Error::from)
        .and_then(|report| serde_json::to_vec_pretty(&report).map_err(anyhow::Error::from));
    match body {
        Ok(body) => reply(StatusCode::OK, body),
        Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn route(path: &str, manager: &OperationManager) -> Response<Body> {
    match path {
        "/healthz" => reply(StatusCode::OK, "ok"),
        "/readyz" => match manager.status_counts() {
            Ok(_) => reply(StatusCode::OK, "ok"),
            Err(e) => reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        },
        "/metrics" => metrics_page(),
        "/pending" => pending_page(manager),
        _ => reply(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn run_health_server(addr: &str, manager: Arc<OperationManager>) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {}", addr))?;
    info!(%addr, "serving health, metrics and pending operations");

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let manager = manager.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = route(req.uri().path(), &manager);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}
