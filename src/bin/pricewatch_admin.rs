use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use pricewatch::bus::ChannelBus;
use pricewatch::config;
use pricewatch::db::{self, SqliteStore};
use pricewatch::gateway::HttpGateway;
use pricewatch::pipeline::{Pipeline, PipelineSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Operator tools for the price-watch store")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a user (or print the id of an existing one with this email)
    AddUser {
        email: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Mark a product as favorited by a user
    Favorite { user_id: i64, product_id: u32 },
    /// Remove a favorite
    Unfavorite { user_id: i64, product_id: u32 },
    /// Print the recorded price/stock changes of a product, oldest first
    History { product_id: u32 },
    /// Run one batch file (a JSON array of snapshots) through the pipeline
    Ingest { file: PathBuf },
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

    match args.command {
        Command::AddUser {
            email,
            username,
            name,
        } => {
            let id =
                db::get_or_create_user(&pool, &email, username.as_deref(), name.as_deref()).await?;
            println!("{id}");
        }
        Command::Favorite {
            user_id,
            product_id,
        } => {
            if db::find_user(&pool, user_id).await?.is_none() {
                anyhow::bail!("user {user_id} not found");
            }
            let added = db::add_favorite(&pool, user_id, product_id).await?;
            info!(user_id, product_id, added, "favorite");
        }
        Command::Unfavorite {
            user_id,
            product_id,
        } => {
            let removed = db::remove_favorite(&pool, user_id, product_id).await?;
            if !removed {
                warn!(user_id, product_id, "no such favorite");
            }
        }
        Command::History { product_id } => {
            for rec in db::change_history(&pool, product_id).await? {
                println!(
                    "{}\tprice {:.2} -> {:.2}\tlist {:.2} -> {:.2}\tstock {} -> {}",
                    rec.changed_at.to_rfc3339(),
                    rec.old_price,
                    rec.new_price,
                    rec.old_original_price,
                    rec.new_original_price,
                    rec.old_stock,
                    rec.new_stock
                );
            }
        }
        Command::Ingest { file } => {
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let (bus, mut forwarded) = ChannelBus::new(cfg.bus.favorites_topic.clone());
            let pipeline = Pipeline::new(
                Arc::new(SqliteStore::new(pool.clone())),
                Arc::new(HttpGateway::from_config(&cfg)?),
                Arc::new(bus),
                PipelineSettings {
                    favorites_topic: cfg.bus.favorites_topic.clone(),
                    dispatch_deadline: cfg.gateway.timeout(),
                },
            );
            let report = pipeline.handle_delivery(&payload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            // Nothing consumes the favorites topic here; just say what was left on it.
            let mut pending = 0;
            while forwarded.try_recv().is_ok() {
                pending += 1;
            }
            if pending > 0 {
                warn!(pending, "forwarded batches were not consumed by this run");
            }
        }
    }
    Ok(())
}
