use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use wayport::{
    load_file, CliOverrides, ConnectListener, Gateway, GatewayConfig, Handshaker, Pool,
};

/// Forward proxy gateway - tunnels client CONNECTs through a pool of upstream proxies
#[derive(Parser, Debug)]
#[command(name = "wayport")]
#[command(about = "Forward proxy gateway with sticky sessions and upstream failover")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wayport.toml")]
    config: String,

    /// Address to listen on (host:port or :port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream proxy list
    #[arg(short = 'f', long)]
    proxy_file: Option<String>,

    /// Default upstream username
    #[arg(short, long)]
    user: Option<String>,

    /// Default upstream password
    #[arg(short, long)]
    pass: Option<String>,

    /// Header carrying the session key
    #[arg(long)]
    sticky_header: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen.clone(),
            proxy_file: self.proxy_file.clone(),
            username: self.user.clone(),
            password: self.pass.clone(),
            sticky_header: self.sticky_header.clone(),
            verbose: self.verbose,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging before config so load errors and warnings are visible
    let (filter, filter_handle) = reload::Layer::new(env_filter("info")?);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load(&args.config)?
        .resolve(args.overrides())
        .with_context(|| format!("Failed to resolve config from {}", args.config))?;

    if config.verbose {
        filter_handle.reload(env_filter("debug")?)?;
        tracing::debug!("Verbose logging enabled");
    }

    tracing::info!("Loading proxies from {}", config.proxy_file.display());
    let registry = load_file(&config.proxy_file, config.default_credentials.as_ref())
        .with_context(|| format!("Failed to load {}", config.proxy_file.display()))?;
    tracing::info!("Loaded {} proxies", registry.len());

    if config.default_credentials.is_some() {
        tracing::info!("Default upstream credentials configured");
    }
    tracing::info!("Sticky session header: {}", config.sticky_header);

    let pool = Pool::new(registry);
    let gateway = Gateway::new(pool, Handshaker::direct());
    let listener = ConnectListener::new(gateway, config.sticky_header.clone());

    tokio::select! {
        result = listener.run(config.listen_addr) => {
            tracing::error!("Listener stopped: {:?}", result);
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

/// `RUST_LOG` plus a default level for this crate
fn env_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env().add_directive(format!("wayport={}", level).parse()?))
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
