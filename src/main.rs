//! geobatch CLI - chunked geospatial batch processing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geobatch::models::Geometry;
use geobatch::transaction::load_checkpoints;
use geobatch::{Chunk, ChunkTransform, ChunkedProcessor, Config, Dataset, LogMonitor, Validator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "geobatch")]
#[command(version)]
#[command(about = "Resilient chunked processing for geospatial batch runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pre-flight validation gate over a dataset
    Validate {
        /// Path to input dataset (JSONL: schema line, then records)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Validate, then run the chunked engine over a dataset
    Process {
        /// Path to input dataset (JSONL: schema line, then records)
        #[arg(short, long)]
        input: PathBuf,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Skip the validation gate
        #[arg(long)]
        skip_validation: bool,
    },

    /// List the transaction checkpoint audit trail
    Checkpoints,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# geobatch configuration file

[engine]
chunk_size = 100
max_workers = 4
# Advisory only: exceeding it is logged, never enforced.
# memory_limit_mb = 512.0

[validation]
required_fields = ["parcel_id", "ndvi"]
expected_crs = "EPSG:4326"
expected_geometry = "polygon"

[transaction]
# database = "${HOME}/data/parcels.db"
checkpoint_dir = "checkpoints"
"#;
    println!("{example}");
}

/// Built-in demo transform: stamp a planar shoelace area onto every polygon
/// record.
fn area_transform() -> ChunkTransform {
    Arc::new(|mut chunk: Chunk| {
        for record in &mut chunk.records {
            if let Some(Geometry::Polygon(ring)) = &record.geometry {
                let area = shoelace_area(ring);
                record
                    .attributes
                    .insert("area".to_string(), serde_json::json!(area));
            }
        }
        Ok(chunk)
    })
}

fn shoelace_area(ring: &[[f64; 2]]) -> f64 {
    let mut twice_area = 0.0;
    for pair in ring.windows(2) {
        twice_area += pair[0][0] * pair[1][1] - pair[1][0] * pair[0][1];
    }
    (twice_area / 2.0).abs()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate { input } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            let validator = Validator::new(&config.validation);
            let name = input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "dataset".to_string());
            let report = validator.validate_file(&input, &name);

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed() {
                std::process::exit(1);
            }
        }

        Commands::Process {
            input,
            output,
            skip_validation,
        } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            let dataset = Dataset::load_jsonl(&input)
                .with_context(|| format!("Failed to load dataset from {input:?}"))?;
            let name = input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "dataset".to_string());

            if !skip_validation {
                let report = Validator::new(&config.validation).validate(&dataset, &name);
                if !report.passed() {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    anyhow::bail!("Validation failed with {} issue(s)", report.issues.len());
                }
                info!(dataset = %name, "Validation passed");
            }

            let monitor = Arc::new(LogMonitor::new());
            let engine = ChunkedProcessor::with_monitor(config.engine.clone(), monitor);
            let outcome = engine.run(&name, dataset, area_transform()).await?;

            let stats = &outcome.stats;
            println!("\n=== Processing Complete ===");
            println!("Chunks:      {}/{}", stats.processed_chunks, stats.total_chunks);
            println!("Records:     {}/{}", stats.processed_records, stats.total_records);
            println!("Failed:      {:?}", stats.failed_chunks);
            println!("Success:     {:.1}%", stats.success_rate * 100.0);

            match outcome.output {
                Some(result) => {
                    result
                        .save_jsonl(&output)
                        .with_context(|| format!("Failed to write output to {output:?}"))?;
                    println!("Output:      {output:?}");
                    if !stats.failed_chunks.is_empty() {
                        // Partial results still count as output; make the gap loud.
                        anyhow::bail!(
                            "{} chunk(s) failed; output is partial",
                            stats.failed_chunks.len()
                        );
                    }
                }
                None => anyhow::bail!("Every chunk failed; no output produced"),
            }
        }

        Commands::Checkpoints => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            let trail = load_checkpoints(&config.checkpoint_dir())
                .context("Failed to read checkpoint trail")?;
            if trail.is_empty() {
                println!("No checkpoints in {:?}", config.checkpoint_dir());
                return Ok(());
            }
            for checkpoint in trail {
                println!(
                    "{}  {}  {:?}",
                    checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    checkpoint.transaction_id,
                    checkpoint.state.state,
                );
                if let Some(error) = &checkpoint.state.error {
                    println!("    error: {error}");
                }
            }
        }
    }

    Ok(())
}
