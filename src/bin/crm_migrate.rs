use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crm_bridge::config::{backup_dir_from_env, open_ledger, MigrateConfig};
use crm_bridge::migration::cache::{load_mapping_context, Selection, SourceCache};
use crm_bridge::migration::ids::{normalize_id, IdMaps, SourceKey};
use crm_bridge::migration::model::EntityType;
use crm_bridge::migration::writer::BatchWriter;
use crm_bridge::tracing::init_tracing;
use crm_bridge::util::env;
use crm_bridge::MigrationEngine;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "crm-migrate",
    version,
    about = "Move deals with their tasks and notes from the source CRM to the destination CRM"
)]
struct Cli {
    /// Directory with the source cache, mapping tables and migration index (default: BACKUP_DIR)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Migrate selected deals with their contacts and companies, then tasks and notes
    Run {
        /// Source deal id; repeat or comma-separate. Overrides the other filters.
        #[arg(long = "deal", value_delimiter = ',')]
        deals: Vec<String>,
        /// Only deals owned by these source managers
        #[arg(long = "manager", value_delimiter = ',')]
        managers: Vec<String>,
        /// Take at most this many not-yet-migrated deals
        #[arg(long)]
        limit: Option<usize>,
        /// Records per bulk create call (default: MIGRATE_CHUNK_SIZE or 50)
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Resolve the selection and print counts without calling either CRM
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Print selection counts against the migration index
    Stats {
        #[arg(long = "manager", value_delimiter = ',')]
        managers: Vec<String>,
    },
    /// Print how many ids per entity type the migration index holds
    Ledger,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("info,crm_bridge=info")?;

    let cli = Cli::parse();
    let backup_dir = cli.backup_dir.unwrap_or_else(backup_dir_from_env);

    match cli.command {
        Commands::Run {
            deals,
            managers,
            limit,
            chunk_size,
            dry_run,
        } => {
            let selection = Selection {
                deal_ids: keys(&deals),
                managers: keys(&managers),
                limit,
            };
            if dry_run {
                dry_run_report(&backup_dir, &selection)?;
            } else {
                let failed = run(backup_dir, selection, chunk_size).await?;
                if failed {
                    std::process::exit(2);
                }
            }
        }
        Commands::Stats { managers } => {
            let cache = SourceCache::load(&backup_dir)?;
            let seed = open_ledger(&backup_dir)?.seed();
            print_json(&cache.stats(&keys(&managers), &seed))?;
        }
        Commands::Ledger => {
            let ledger = open_ledger(&backup_dir)?;
            info!(path = %ledger.path().display(), "migration index");
            print_json(&ledger.counts())?;
        }
    }
    Ok(())
}

/// Returns true when the run finished with errors.
async fn run(backup_dir: PathBuf, selection: Selection, chunk_size: Option<usize>) -> Result<bool> {
    let cfg = MigrateConfig::from_env()
        .context("run needs source and destination credentials")?
        .with_chunk_size(chunk_size)
        .with_backup_dir(Some(backup_dir));

    let cache = SourceCache::load(&cfg.backup_dir)?;
    let mapping = load_mapping_context(&cfg.backup_dir)?;
    let mut ledger = cfg.open_ledger()?;
    let seed = ledger.seed();
    let deals = cache.select(&selection, &seed)?;
    let tasks = cache.all_tasks();
    if deals.is_empty() {
        warn!("no deals selected; nothing to migrate");
    }

    let destination = cfg.destination_client()?;
    let source = cfg.source_client()?;
    let writer = BatchWriter::new(&destination, cfg.throttle(), cfg.chunk_size);
    let mut engine = MigrationEngine::new(&source, writer, &mut ledger, &mapping)
        .with_pipeline(cfg.pipeline_id)
        .with_relations(&cache.contacts, &cache.companies);

    let result = engine.migrate(&deals, &tasks, Some(seed)).await;
    print_json(&result)?;
    Ok(!result.errors.is_empty())
}

fn dry_run_report(backup_dir: &std::path::Path, selection: &Selection) -> Result<()> {
    let cache = SourceCache::load(backup_dir)?;
    let seed: IdMaps = open_ledger(backup_dir)?.seed();
    let deals = cache.select(selection, &seed)?;
    let already = deals
        .iter()
        .filter(|d| seed.get(EntityType::Deal, &d.id).is_some())
        .count();
    let selected: std::collections::HashSet<SourceKey> =
        deals.iter().map(|d| normalize_id(&d.id)).collect();
    let tasks = cache
        .all_tasks()
        .iter()
        .filter(|t| t.entity_type.as_deref() == Some(EntityType::Deal.api_name()))
        .filter(|t| t.entity_id.as_ref().is_some_and(|id| selected.contains(&normalize_id(id))))
        .count();
    print_json(&json!({
        "selected_deals": deals.len(),
        "already_migrated": already,
        "to_create": deals.len() - already,
        "linked_tasks": tasks,
    }))
}

fn keys(raw: &[String]) -> Vec<SourceKey> {
    raw.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(normalize_id)
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
