use anyhow::Context;
use clap::Parser;
use shardmux::{listener, logging, stats, Pool, Stats};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

const MIN_CHUNK_SIZE: usize = 512;
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// A fast proxy that shards memcached and Redis traffic over backend pools.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Pool configuration file.
    #[arg(short, long, env = "SHARDMUX_CONFIG")]
    config: PathBuf,

    /// Address the stats endpoint binds to.
    #[arg(long, default_value = "0.0.0.0", env = "STATS_ADDR")]
    stats_addr: String,

    /// Port the stats endpoint binds to.
    #[arg(long, default_value = "22222", env = "STATS_PORT")]
    stats_port: u16,

    /// Read-buffer chunk size in bytes.
    #[arg(long, default_value = "16384", env = "MBUF_SIZE")]
    mbuf_size: usize,

    /// Raise the default log level to debug.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::install(cli.verbose);

    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&cli.mbuf_size) {
        anyhow::bail!(
            "mbuf size {} out of range [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
            cli.mbuf_size
        );
    }

    let contents = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config {}", cli.config.display()))?;
    let pool_settings = shardmux::load_config(&contents, cli.mbuf_size)?;

    tracing::info!(
        pools = pool_settings.len(),
        config = %cli.config.display(),
        "starting shardmux"
    );

    let mut registry = Stats::new();
    let cancel = tokio_util::sync::CancellationToken::new();

    let mut pools = Vec::with_capacity(pool_settings.len());
    for settings in pool_settings {
        pools.push(Pool::new(settings, &mut registry, cancel.child_token()));
    }
    let registry = Arc::new(registry);

    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, shutting down");
        ctrl_c_token.cancel();
    });

    let stats_listener = TcpListener::bind((cli.stats_addr.as_str(), cli.stats_port))
        .await
        .context("failed to bind stats port")?;
    tracing::info!(addr = %format!("{}:{}", cli.stats_addr, cli.stats_port), "stats endpoint");
    tokio::spawn(stats::serve(
        stats_listener,
        registry.clone(),
        cancel.child_token(),
    ));

    for pool in pools {
        if pool.settings.preconnect {
            pool.preconnect().await;
        }
        let stats = registry.clone();
        let token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = listener::listen(pool.clone(), stats, token).await {
                tracing::error!(pool = %pool.settings.name, %err, "listener failed");
            }
        });
    }

    cancel.cancelled().await;
    Ok(())
}
