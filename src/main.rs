use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use tier_curator::domain::PartitionKey;
use tier_curator::logging;
use tier_curator::observability;
use tier_curator::pipeline::processing::EntryMetadata;
use tier_curator::pipeline::RunReport;
use tier_curator::{CurateConfig, CurationOrchestrator, DatasetRegistry};

#[derive(Parser)]
#[command(name = "tier-curator")]
#[command(about = "Curates raw partitioned datasets into cleaned and curated tiers")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Print the Prometheus metrics snapshot before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process raw partitions into the cleaned and curated tiers
    Run {
        /// Datasets to run (repeatable). Defaults to every registered dataset
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Only these partitions (repeatable), e.g. 2024-03-15
        #[arg(long = "partition")]
        partitions: Vec<String>,
    },
    /// Deposit a line-delimited JSON file into a dataset's raw tier
    Ingest {
        dataset: String,
        file: PathBuf,
        /// Deposit every record into this partition instead of routing by date
        #[arg(long)]
        partition: Option<String>,
    },
    /// List registered datasets and their curated outputs
    Datasets,
    /// Inspect and manage the catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// List published entries
    List,
    /// Show one entry and its replaced versions
    Describe { name: String },
    /// Print the external table statements for an entry
    Ddl { name: String },
    /// Publish or replace an entry
    Publish {
        name: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        compression: Option<String>,
        /// Replace an existing entry whose metadata differs
        #[arg(long)]
        confirm: bool,
    },
}

fn load_config(path: &Path) -> anyhow::Result<CurateConfig> {
    if path.exists() {
        return CurateConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()));
    }
    let mut config = CurateConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn print_report(report: &RunReport) {
    println!("\n📊 Results for {}:", report.dataset);
    for p in &report.partitions {
        println!(
            "   {}: read {}, valid {}, quarantined {}, errored {}, deduplicated {}, written {} ({} new){}",
            p.partition,
            p.read,
            p.valid,
            p.quarantined,
            p.errored,
            p.deduplicated,
            p.written,
            p.new_records,
            if p.skipped_unchanged { ", unchanged" } else { "" }
        );
    }
    for a in &report.aggregates {
        let window = if a.window_complete {
            "complete".to_string()
        } else {
            format!("incomplete, missing {}", a.missing_partitions.join(", "))
        };
        println!("   📈 {}: {} rows ({})", a.name, a.rows, window);
    }
    if !report.published.is_empty() {
        println!("   📚 Catalog: {}", report.published.join(", "));
    }
    if !report.failures.is_empty() {
        println!("\n⚠️  Failures:");
        for failure in &report.failures {
            println!("   - {}", failure);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    let _log_guard = logging::init_logging(&config.logging.log_dir);
    if let Err(e) = observability::init() {
        warn!("Metrics recorder not installed: {}", e);
    }

    let registry = match &config.registry.datasets_dir {
        Some(dir) => DatasetRegistry::with_directory(dir)?,
        None => DatasetRegistry::builtin(),
    };
    let orchestrator = CurationOrchestrator::open(config, registry)?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, finishing in-flight commits and stopping");
            cancel.cancel();
        }
    });

    let mut failed = false;
    match cli.command {
        Commands::Run {
            datasets,
            partitions,
        } => {
            let names = if datasets.is_empty() {
                orchestrator.registry().names()
            } else {
                datasets
            };
            let only = if partitions.is_empty() {
                None
            } else {
                Some(
                    partitions
                        .into_iter()
                        .map(PartitionKey::new)
                        .collect::<Result<Vec<_>, _>>()?,
                )
            };
            for name in names {
                info!("🔄 Running {}", name);
                match orchestrator.run_dataset(&name, only.clone()).await {
                    Ok(report) => {
                        failed |= !report.success();
                        print_report(&report);
                    }
                    Err(e) => {
                        failed = true;
                        error!("Run of {} failed: {}", name, e);
                        println!("❌ {}: {}", name, e);
                    }
                }
            }
        }
        Commands::Ingest {
            dataset,
            file,
            partition,
        } => {
            let partition = partition.map(PartitionKey::new).transpose()?;
            let counts = orchestrator.ingest_ndjson(&dataset, &file, partition).await?;
            for (key, count) in counts {
                println!("📥 {}/{}: {} records", dataset, key, count);
            }
        }
        Commands::Datasets => {
            for dataset in orchestrator.registry().datasets() {
                let identity = if dataset.identity_key.is_empty() {
                    "whole record".to_string()
                } else {
                    dataset.identity_key.join(", ")
                };
                println!("{} (identity: {})", dataset.name, identity);
                for agg in &dataset.aggregates {
                    println!("   └─ {} by {}", agg.name, agg.grouping.join(", "));
                }
            }
        }
        Commands::Catalog { command } => match command {
            CatalogCommands::List => {
                for entry in orchestrator.catalog().list()? {
                    println!(
                        "{} v{} [{}] {} ({}, {})",
                        entry.name,
                        entry.version,
                        entry.metadata.tier,
                        entry.metadata.location,
                        entry.metadata.format,
                        entry.metadata.compression
                    );
                }
            }
            CatalogCommands::Describe { name } => {
                let Some(entry) = orchestrator.catalog().describe(&name)? else {
                    bail!("no catalog entry named '{}'", name);
                };
                println!("{}", serde_json::to_string_pretty(&entry)?);
                let triple = orchestrator.external_triple(&name)?;
                println!(
                    "🔗 external: {} -> {} ({})",
                    triple.name, triple.location, triple.format
                );
                for old in orchestrator.catalog().history(&name)? {
                    println!(
                        "   replaced: v{} {} at {}",
                        old.version, old.metadata.location, old.published_at
                    );
                }
            }
            CatalogCommands::Ddl { name } => {
                let triple = orchestrator.external_triple(&name)?;
                println!(
                    "-- {} at {} ({})\n",
                    triple.name, triple.location, triple.format
                );
                for statement in orchestrator.ddl(&name)? {
                    println!("{}\n", statement);
                }
            }
            CatalogCommands::Publish {
                name,
                location,
                format,
                compression,
                confirm,
            } => {
                let defaults = orchestrator.entry_metadata(&name)?;
                let metadata = EntryMetadata {
                    tier: defaults.tier,
                    dataset: defaults.dataset,
                    location: location.unwrap_or(defaults.location),
                    format: format.unwrap_or(defaults.format),
                    compression: compression.unwrap_or(defaults.compression),
                };
                let outcome = orchestrator.publish(&name, Some(metadata), confirm)?;
                println!(
                    "📚 {} {} (version {})",
                    name,
                    outcome.label(),
                    outcome.entry().version
                );
            }
        },
    }

    if cli.print_metrics {
        if let Some(snapshot) = observability::render() {
            println!("{}", snapshot);
        }
    }

    if failed {
        bail!("one or more partitions failed; see the report above");
    }
    Ok(())
}
