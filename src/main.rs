mod logging;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tiercache::cache::{CacheEvent, Chain, EntityTiers};
use tiercache::config::Config;
use tiercache::origin::HttpFetch;

#[derive(Parser, Debug)]
#[command(name = "tiercache")]
#[command(about = "Multi-tier expiring cache for remote JSON entities")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tiercache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load an entity through its chain, fetching from the origin on a miss
  Load { entity: String },
  /// Print the first locally cached value without fetching
  Peek { entity: String },
  /// Drop the cached value from every tier
  Clear { entity: String },
  /// Set an earlier expiration (RFC 3339) on every storing tier
  Expire { entity: String, date: String },
  /// Delete the entity's persisted cache files
  Destroy { entity: String },
  /// List configured entities
  Entities,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.storage_dir()?.join("logs"), args.verbose)?;

  match args.command {
    Command::Entities => {
      for (name, entity) in &config.entities {
        let tiers: Vec<String> = entity.tiers.iter().map(|k| k.to_string()).collect();
        println!("{}\t[{}]\t{}", name, tiers.join(", "), entity.url);
      }
      Ok(())
    }
    Command::Load { entity } => {
      with_chain(&config, &entity, |chain| async move {
        let value = chain.head().load_value().await?;
        print_value(value.as_ref(), chain.head().expiration())
      })
      .await
    }
    Command::Peek { entity } => {
      with_chain(&config, &entity, |chain| async move {
        for tier in chain.tiers() {
          if !tier.capabilities().needs_source {
            continue;
          }
          if let Some(value) = tier.load_from_cache().await? {
            info!("Peeked {}", tier.name());
            return print_value(Some(&value), tier.expiration());
          }
        }
        print_value(None, chain.head().expiration())
      })
      .await
    }
    Command::Clear { entity } => {
      with_chain(&config, &entity, |chain| async move {
        let mut cleared = 0;
        // Origin side first so each clear cascades toward the head
        for tier in chain.tiers().iter().rev() {
          if tier.capabilities().needs_source && tier.clear_cache().await? {
            cleared += 1;
          }
        }
        for tier in chain.tiers() {
          tier.drain().await;
        }
        println!("cleared {} tier(s)", cleared);
        Ok(())
      })
      .await
    }
    Command::Expire { entity, date } => {
      let date: DateTime<Utc> = DateTime::parse_from_rfc3339(&date)
        .map_err(|e| eyre!("Invalid date {:?}: {}", date, e))?
        .with_timezone(&Utc);
      with_chain(&config, &entity, |chain| async move {
        for tier in chain.tiers().iter().rev() {
          if tier.capabilities().needs_source {
            tier.set_expiration(date).await?;
          }
        }
        println!(
          "expires {}",
          chain.head().expiration().to_rfc3339_opts(SecondsFormat::AutoSi, true)
        );
        Ok(())
      })
      .await
    }
    Command::Destroy { entity } => {
      let chain = build_chain(&config, &entity).await?;
      chain.init().await?;
      let destroyed = chain.destroy().await?;
      println!("destroyed {} tier(s)", destroyed);
      Ok(())
    }
  }
}

async fn build_chain(config: &Config, entity: &str) -> Result<Chain<Value>> {
  let entity_config = config.entity(entity)?;
  let factory = EntityTiers::new(
    entity,
    Arc::new(config.policy()?),
    config.file_namer()?,
    Arc::new(HttpFetch::new(&entity_config.url)?),
  )
  .with_lock_options(config.lock_options());

  Chain::build(&entity_config.tiers, &factory).await
}

/// Build and initialize the entity's chain, run `op`, then dispose the chain
/// whether or not `op` succeeded.
async fn with_chain<F, Fut>(config: &Config, entity: &str, op: F) -> Result<()>
where
  F: FnOnce(Arc<Chain<Value>>) -> Fut,
  Fut: std::future::Future<Output = Result<()>>,
{
  let chain = Arc::new(build_chain(config, entity).await?);

  let mut events = chain.subscribe();
  let reporter = tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      if let CacheEvent::Error(failure) = event {
        warn!("{}", failure);
      }
    }
  });

  let result = match chain.init().await {
    Ok(()) => op(Arc::clone(&chain)).await,
    Err(e) => Err(e),
  };
  let disposed = chain.dispose().await;
  reporter.abort();

  result?;
  disposed
}

fn print_value(value: Option<&Value>, expiration: DateTime<Utc>) -> Result<()> {
  match value {
    Some(value) => {
      let json = serde_json::to_string_pretty(value)
        .map_err(|e| eyre!("Failed to encode value: {}", e))?;
      println!("{}", json);
      eprintln!(
        "expires {}",
        expiration.to_rfc3339_opts(SecondsFormat::AutoSi, true)
      );
    }
    None => println!("null"),
  }
  Ok(())
}
