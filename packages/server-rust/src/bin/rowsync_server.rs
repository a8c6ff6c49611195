//! `RowSync` server binary serving the demo data service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rowsync_server::demo::{build_demo, DemoService};
use rowsync_server::service::ServiceDefinition;
use rowsync_server::{
    NetworkConfig, NetworkModule, OperationRouter, OperationService, ServerConfig, ServiceConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Fmt,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rowsync-server")]
#[command(about = "RowSync change-set synchronization server", long_about = None)]
struct Args {
    #[arg(long, env = "ROWSYNC_HOST", default_value = "0.0.0.0")]
    host: String,

    /// 0 asks the OS for a free port.
    #[arg(short, long, env = "ROWSYNC_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "ROWSYNC_LOG_FORMAT", value_enum, default_value = "fmt")]
    log_format: LogFormat,

    /// Comma-separated allowed CORS origins.
    #[arg(long, env = "ROWSYNC_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// HTTP request timeout in seconds.
    #[arg(long, env = "ROWSYNC_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Per-operation timeout in milliseconds. 0 disables it.
    #[arg(long, env = "ROWSYNC_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    operation_timeout_ms: u64,

    #[arg(long, env = "ROWSYNC_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent_operations: u32,

    /// Concurrent change sets and invokes.
    #[arg(long, env = "ROWSYNC_MAX_CONCURRENT_WRITES", default_value_t = 100)]
    max_concurrent_writes: u32,

    #[arg(long, env = "ROWSYNC_PAGE_SIZE", default_value_t = 100)]
    default_page_size: u32,

    /// Server local time offset from UTC in minutes.
    #[arg(long, env = "ROWSYNC_UTC_OFFSET_MINUTES", default_value_t = 0, allow_hyphen_values = true)]
    utc_offset_minutes: i32,

    /// Report unexpected error text to clients.
    #[arg(long, env = "ROWSYNC_EXPOSE_ERRORS")]
    expose_errors: bool,
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rowsync_server=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Fmt => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?,
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let service_config = ServiceConfig {
        default_page_size: args.default_page_size,
        server_utc_offset_minutes: args.utc_offset_minutes,
        expose_unexpected_errors: args.expose_errors,
        ..ServiceConfig::default()
    };
    let server_config = ServerConfig {
        node_id: uuid::Uuid::new_v4().to_string(),
        default_operation_timeout_ms: args.operation_timeout_ms,
        max_concurrent_operations: args.max_concurrent_operations,
        max_concurrent_writes: args.max_concurrent_writes,
    };
    let network_config = NetworkConfig {
        host: args.host,
        port: args.port,
        cors_origins: args.cors_origins,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        ..NetworkConfig::default()
    };

    let demo = build_demo(service_config)?;
    let mut router = OperationRouter::new();
    router.register(DemoService::service_name(), demo.service);
    let operations = Arc::new(OperationService::new(router, Arc::new(server_config)));

    let mut module = NetworkModule::new(network_config, operations);
    let port = module.start().await?;
    info!(port, "rowsync server started");

    module
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("rowsync server stopped");
    Ok(())
}
