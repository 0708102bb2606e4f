mod config;

use clap::{Parser, Subcommand};
use config::DashgateConfig;
use dashgate_gateway::{GatewayServer, MiddlewareState};
use dashgate_security::{AuditLog, RateLimiter, TokenStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dashgate", about = "dashgate — security gate for the local admin dashboard")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dashgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gated dashboard API
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage the dashboard token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a new token; the current one stays valid for the grace period
    Rotate,
    /// Show the age of the current token
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = DashgateConfig::load(&cli.config)?;

    let audit = Arc::new(AuditLog::new(config.audit_log_config()));
    let tokens = Arc::new(TokenStore::new(config.token_store_config()).with_audit(audit.clone()));

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            serve(&config, &host, port, tokens, audit).await?;
        }
        Commands::Token { action } => match action {
            TokenAction::Rotate => {
                let token = tokens.rotate()?;
                audit.flush().await;
                let grace = config.token_store_config().grace_period.as_secs();
                println!("{token}");
                eprintln!(
                    "New dashboard token written to {}. The previous token stays valid for {grace}s.",
                    tokens.path().display()
                );
            }
            TokenAction::Info => match tokens.info() {
                Some(info) => {
                    println!("Token age:       {}h", info.age_hours);
                    println!("Remaining:       {}h", info.remaining_hours);
                    println!("Max age:         {} days", info.max_age_days);
                    println!("Expired:         {}", if info.expired { "yes" } else { "no" });
                }
                None => {
                    println!("No dashboard token configured (open mode).");
                    println!("Issue one with: dashgate token rotate");
                }
            },
        },
    }

    Ok(())
}

async fn serve(
    config: &DashgateConfig,
    host: &str,
    port: u16,
    tokens: Arc<TokenStore>,
    audit: Arc<AuditLog>,
) -> anyhow::Result<()> {
    let rate_config = config.rate_limit_config();
    let idle = rate_config.window;
    let rate_limiter = Arc::new(RateLimiter::new(rate_config).with_audit(audit.clone()));

    if tokens.state().is_configured() {
        info!(path = %tokens.path().display(), "Dashboard token auth enabled");
    } else {
        warn!("No dashboard token configured, API is open. Run `dashgate token rotate` to enable auth");
    }

    let cleanup = {
        let rate_limiter = rate_limiter.clone();
        let every = Duration::from_secs(config.rate_limit.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                rate_limiter.cleanup(idle).await;
            }
        })
    };

    let state = Arc::new(MiddlewareState {
        tokens,
        rate_limiter,
        audit: audit.clone(),
    });
    let app = GatewayServer::build(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("dashgate listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cleanup.abort();
    audit.flush().await;
    info!("dashgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
