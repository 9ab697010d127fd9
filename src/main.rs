use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};

use pricewatch::bus::{self, ChannelBus, Publisher};
use pricewatch::config;
use pricewatch::db::{self, SqliteStore};
use pricewatch::gateway::HttpGateway;
use pricewatch::pipeline::{Pipeline, PipelineSettings};
use pricewatch::scheduler::{HttpSnapshotSource, PollScheduler};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Consume product snapshot batches (one JSON array per stdin line) and notify on price drops"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let gateway = Arc::new(HttpGateway::from_config(&cfg)?);
    let (bus, receiver) = ChannelBus::new(cfg.bus.favorites_topic.clone());
    let pipeline = Pipeline::new(
        store.clone(),
        gateway,
        Arc::new(bus.clone()),
        PipelineSettings {
            favorites_topic: cfg.bus.favorites_topic.clone(),
            dispatch_deadline: cfg.gateway.timeout(),
        },
    );

    let scheduler = match (cfg.scheduler.enabled, cfg.scheduler.source_base_url.as_deref()) {
        (true, Some(base)) => {
            let base = Url::parse(base).context("invalid scheduler.source_base_url")?;
            let source = HttpSnapshotSource::new(base, cfg.gateway.timeout())?;
            Some(
                PollScheduler::new(
                    store.clone(),
                    Arc::new(source),
                    Arc::new(bus.clone()),
                    cfg.bus.favorites_topic.clone(),
                    Duration::from_secs(cfg.scheduler.interval_secs),
                )
                .start(),
            )
        }
        _ => None,
    };

    // stdin feeds the bus; EOF ends the run unless the scheduler keeps it alive.
    let (eof_tx, eof_rx) = oneshot::channel::<()>();
    let stdin_bus = bus.clone();
    let topic = cfg.bus.favorites_topic.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if let Err(err) = stdin_bus.publish(&topic, line.into_bytes()).await {
                        warn!(?err, "failed to enqueue stdin batch");
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "stdin read failed");
                    break;
                }
            }
        }
        let _ = eof_tx.send(());
    });

    let keep_running = scheduler.is_some();
    let shutdown = async move {
        if keep_running {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            tokio::select! {
                _ = eof_rx => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        info!("shutdown requested");
    };

    info!(topic = %bus.topic(), "consuming");
    let stats = bus::run_consumer(receiver, &pipeline, shutdown).await;
    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    info!(
        deliveries = stats.deliveries,
        decode_failures = stats.decode_failures,
        totals = ?stats.totals,
        "pricewatch finished"
    );
    Ok(())
}
