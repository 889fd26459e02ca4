// SPDX-License-Identifier: MIT

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use onboard_sync::cache::{CacheKeys, FileDraftCache};
use onboard_sync::draft::Draft;
use onboard_sync::offline::OfflineQueue;
use onboard_sync::session::HttpSessionClient;
use onboard_sync::wizard::WizardLoader;
use onboard_sync::SyncConfig;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; ONBOARDING_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a draft against a wizard definition with the local schemas
    Validate {
        /// Path to the wizard definition
        #[arg(short, long)]
        wizard: PathBuf,

        /// Path to a draft JSON file (step id to step payload)
        #[arg(short, long)]
        draft: PathBuf,
    },
    /// List entries waiting in the offline queue
    Queue {
        /// Cache directory holding the queue
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Replay the offline queue once against the onboarding API
    Sync {
        /// Cache directory holding the queue
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Onboarding API base URL
        #[arg(long)]
        api: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?
            .with_env_overrides()?,
        None => SyncConfig::from_env()?,
    };
    Ok(config)
}

fn open_queue(config: &SyncConfig, cache_dir: Option<PathBuf>) -> Result<OfflineQueue> {
    let dir = cache_dir
        .or_else(|| config.cache_dir.clone())
        .context("no cache directory: pass --cache-dir or set ONBOARDING_CACHE_DIR")?;
    let cache = FileDraftCache::open(&dir, config.cache_quota_bytes)
        .with_context(|| format!("opening cache {}", dir.display()))?;
    let keys = CacheKeys::new(config.cache_namespace.clone());
    Ok(OfflineQueue::load(
        Arc::new(cache),
        keys.queue(),
        config.stale_after(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;

    match args.command {
        Commands::Validate { wizard, draft } => {
            let def = WizardLoader::new().load_wizard(&wizard)?;
            let raw = fs::read_to_string(&draft)
                .with_context(|| format!("reading {}", draft.display()))?;
            let draft: Draft = serde_json::from_str(&raw).context("draft is not valid JSON")?;
            let pipeline = def.pipeline();

            println!("Wizard: {}", def.name);
            let mut blocking = 0;
            for step in &def.steps {
                let verdict = pipeline.validate_local(&step.id, draft.step(&step.id));
                let label = match (verdict.is_valid, step.optional) {
                    (true, _) => "ok",
                    (false, true) => "incomplete (optional)",
                    (false, false) => {
                        blocking += 1;
                        "invalid"
                    }
                };
                println!("{:<24} {}", step.id, label);
                for error in &verdict.errors {
                    println!("    error: {}", error);
                }
                for warning in &verdict.warnings {
                    println!("    warning: {}", warning);
                }
            }
            if blocking > 0 {
                bail!("{} required step(s) invalid", blocking);
            }
        }
        Commands::Queue { cache_dir } => {
            let queue = open_queue(&config, cache_dir)?;
            let entries = queue.entries();
            if entries.is_empty() {
                println!("No pending entries");
            }
            for entry in entries {
                println!(
                    "{}  {:<14} {:<16} retries={} queued={}{}",
                    entry.id,
                    entry.session_id,
                    format!("{:?}", entry.kind),
                    entry.retry_count,
                    entry.enqueued_at.to_rfc3339(),
                    entry
                        .last_error
                        .map(|e| format!(" last_error=\"{}\"", e))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Sync { cache_dir, api } => {
            if let Some(api) = api {
                config.api_base_url = api;
            }
            let queue = open_queue(&config, cache_dir)?;
            if queue.is_empty() {
                println!("Nothing to sync");
                return Ok(());
            }
            let client = HttpSessionClient::from_config(&config)?;
            log::info!("Replaying {} entries against {}", queue.len(), config.api_base_url);

            let report = queue.replay(&client).await;
            println!(
                "Applied {}, already synced {}, superseded {}, remaining {}",
                report.applied,
                report.already_synced,
                report.superseded.len(),
                report.remaining
            );
            if let Some(failure) = report.failure {
                bail!("Replay stopped at entry {}: {}", failure.entry_id, failure.message);
            }
        }
    }

    Ok(())
}
