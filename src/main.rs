use clap::Parser;
use ferrolb::admin::AdminService;
use ferrolb::admin_listener::AdminListener;
use ferrolb::config::{Config, PersistenceConfig};
use ferrolb::factory;
use ferrolb::listener::Listener;
use ferrolb::proxy::EngineOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ferrolb", about = "HTTP/1.1 reverse-proxy load balancer")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "conf/ferrolb.conf")]
    config: PathBuf,

    /// Override the configured load balancing algorithm
    /// (round_robin, weighted_round_robin, least_connections).
    #[arg(long)]
    algorithm: Option<String>,

    /// Override the configured persistence method
    /// (none, cookie, ip_hash, consistent_hash).
    #[arg(long)]
    persistence: Option<String>,

    /// Proxy listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Admin listen address (/health, /metrics, /api/stats).
    #[arg(long, default_value = "127.0.0.1:8081")]
    admin: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(&cli.config)?;
    if let Some(algorithm) = &cli.algorithm {
        config.method = algorithm.parse()?;
    }
    if let Some(persistence) = &cli.persistence {
        config.persistence = PersistenceConfig::from_name(persistence)?;
    }

    let engine = Arc::new(factory::build_engine(&config, EngineOptions::default())?);
    info!(
        method = engine.router().default_pool().scheduler_name(),
        persistence = engine.router().default_pool().persistence_name(),
        pools = engine.router().pools().len(),
        "load balancer configured"
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let proxy_listener = Listener::bind(&cli.listen, Arc::clone(&engine)).await?;
    info!("proxy listening on {}", proxy_listener.local_addr());

    let admin_listener = AdminListener::bind(&cli.admin, AdminService::new(engine)).await?;
    info!(
        "admin endpoints on {} (/health, /metrics, /api/stats)",
        admin_listener.local_addr()
    );

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy_listener.serve(shutdown_rx).await {
                error!("proxy listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut proxy_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut proxy_task => {
            proxy_finished = true;
            if let Err(err) = res {
                error!("proxy task join error: {}", err);
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            if let Err(err) = res {
                error!("admin task join error: {}", err);
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !proxy_finished {
        if let Err(err) = proxy_task.await {
            error!("proxy task join error: {}", err);
        }
    }

    if !admin_finished {
        if let Err(err) = admin_task.await {
            error!("admin task join error: {}", err);
        }
    }

    info!("shutdown complete");
    Ok(())
}
