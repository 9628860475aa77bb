//! Command-line interface for the circuit pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{ClusteringMethod, FoldPolicy};
use crate::core::loaders::{filter_city, load_address_table, CsvDirectoryProvider};
use crate::core::writers::write_streets_csv;
use crate::processors::streets::aggregate_streets;
use crate::processors::territory::{process_address_file, write_partition, PartitionRequest, PartitionResult};
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "circuit-pipeline")]
#[command(about = "Balanced partitioning of city addresses into circuits", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise an address table per street (count, position, length)
    Streets {
        /// Address CSV file (optionally gzip-compressed)
        input: PathBuf,
        /// Output CSV file
        #[arg(short, long, default_value = "streets.csv")]
        output: PathBuf,
        /// Keep only addresses of this city
        #[arg(long)]
        city: Option<String>,
    },

    /// Partition an address table into circuits
    Partition {
        /// Address CSV file (optionally gzip-compressed)
        input: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = "circuits")]
        output_dir: PathBuf,
        /// Keep only addresses of this city
        #[arg(long)]
        city: Option<String>,
        /// Number of circuits
        #[arg(short = 'k', long)]
        circuits: Option<usize>,
        /// kmeans, balanced_count, balanced_length, weighted_count or weighted_length
        #[arg(short, long)]
        method: Option<ClusteringMethod>,
        /// Allowed deviation from the even split (balanced methods)
        #[arg(short, long)]
        tolerance: Option<f64>,
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
        /// Fold split streets into their first cluster instead of the majority one
        #[arg(long)]
        fold_first: bool,
    },

    /// Run a JSON partition request against a directory of department tables
    Request {
        /// JSON file with city_name, dep_code, cluster_nbr, clustering_method, cluster_colors
        request: PathBuf,
        /// Directory holding adresses-{dep}.csv.gz (or .csv) files
        #[arg(short, long)]
        data_dir: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = "circuits")]
        output_dir: PathBuf,
    },

    /// Write the default configuration to a YAML file
    InitConfig {
        /// Output YAML path
        #[arg(default_value = "pipeline.yaml")]
        path: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    let outcome = match cli.command {
        Commands::Streets { input, output, city } => cmd_streets(&input, &output, city.as_deref(), &config),
        Commands::Partition {
            input,
            output_dir,
            city,
            circuits,
            method,
            tolerance,
            seed,
            fold_first,
        } => {
            let mut config = config;
            let c = &mut config.circuits;
            c.n_circuits = circuits.unwrap_or(c.n_circuits);
            c.method = method.unwrap_or(c.method);
            c.tolerance = tolerance.unwrap_or(c.tolerance);
            c.seed = seed.unwrap_or(c.seed);
            if fold_first {
                c.fold_policy = FoldPolicy::First;
            }
            cmd_partition(&input, &output_dir, city.as_deref(), &config)
        }
        Commands::Request {
            request,
            data_dir,
            output_dir,
        } => cmd_request(&request, &data_dir, &output_dir, &config),
        Commands::InitConfig { path } => cmd_init_config(&path, &config),
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn delimiter(config: &PipelineConfig) -> Result<u8> {
    u8::try_from(config.data.delimiter)
        .with_context(|| format!("delimiter '{}' is not a single byte", config.data.delimiter))
}

fn cmd_streets(input: &Path, output: &Path, city: Option<&str>, config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();
    let spinner = create_spinner("Aggregating streets...");

    let mut records = load_address_table(input, &config.data)
        .with_context(|| format!("failed to load {}", input.display()))?;
    if let Some(city) = city {
        records = filter_city(records, city);
    }
    let aggregation = aggregate_streets(&records, &config.streets)?;
    write_streets_csv(output, &aggregation.streets, delimiter(config)?)?;

    spinner.finish_and_clear();

    print_summary(
        "Street Aggregation Complete",
        &[
            ("Input file", input.display().to_string()),
            ("Output CSV", output.display().to_string()),
            ("Addresses", records.len().to_string()),
            ("Streets", aggregation.streets.len().to_string()),
            ("Warnings", aggregation.warnings.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn summarize_partition(title: &str, output_dir: &Path, result: &PartitionResult, config: &PipelineConfig, start: Instant) {
    let circuits = &config.circuits;
    let names: Vec<String> = result.stats.iter().map(|(id, _)| circuits.style(id).name).collect();
    let mut items = vec![
        ("Output directory", output_dir.display().to_string()),
        ("Method", circuits.method.to_string()),
        ("Addresses", result.addresses.len().to_string()),
        ("Streets", result.streets.len().to_string()),
    ];
    if let Some(bounds) = &result.bounds {
        items.push(("Size bounds", format!("[{}, {}] of {}", bounds.min, bounds.max, bounds.points)));
    }
    if !result.out_of_bounds.is_empty() {
        items.push(("Out of bounds", format!("{:?}", result.out_of_bounds)));
    }
    for ((_, totals), name) in result.stats.iter().zip(&names) {
        items.push((name.as_str(), format!("{} addresses, {} m", totals.count, totals.length)));
    }
    items.push(("Warnings", result.warnings.len().to_string()));
    items.push(("Duration", format!("{:.2?}", start.elapsed())));

    print_summary(title, &items);
}

fn cmd_partition(input: &Path, output_dir: &Path, city: Option<&str>, config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();

    println!("Partitioning addresses...");
    println!("Input: {}", input.display());
    println!("Circuits: {}", config.circuits.n_circuits);
    println!("Method: {}", config.circuits.method);

    let spinner = create_spinner("Clustering streets...");
    let outcome = process_address_file(input, output_dir, city, config);
    spinner.finish_and_clear();

    let (_, result) = outcome.with_context(|| format!("partition of {} failed", input.display()))?;
    summarize_partition("Partition Complete", output_dir, &result, config, start);
    Ok(())
}

fn cmd_request(request: &Path, data_dir: &Path, output_dir: &Path, config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();

    let content = std::fs::read_to_string(request)
        .with_context(|| format!("failed to read {}", request.display()))?;
    let request: PartitionRequest = serde_json::from_str(&content).context("invalid partition request")?;

    println!("City: {} ({})", request.city_name, request.dep_code);
    println!("Circuits: {}", request.cluster_nbr);
    println!("Method: {}", request.clustering_method);

    let spinner = create_spinner("Clustering streets...");
    let provider = CsvDirectoryProvider::new(data_dir, config.data.clone());
    let outcome = request.run(&provider, config);
    spinner.finish_and_clear();
    let result = outcome?;

    write_partition(&result, output_dir, delimiter(config)?)?;

    let mut shown = config.clone();
    shown.circuits = request.to_config(&config.circuits)?;
    summarize_partition("Request Complete", output_dir, &result, &shown, start);
    Ok(())
}

fn cmd_init_config(path: &Path, config: &PipelineConfig) -> Result<()> {
    config
        .to_yaml(path)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}
