//! HoVer-NeXt Pipeline CLI
//!
//! Nuclei segmentation and classification over images, numpy arrays and whole-slide images.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hover_next_pipeline::error::{EXIT_FAILURE, EXIT_SUCCESS};
use hover_next_pipeline::pipeline::PlanState;
use hover_next_pipeline::{
    build_runtime, plan_run, run_pipeline, CheckpointLoader, Config, EnsembleLoader, Metric,
    Overrides, PipelineError, Result, RunOutcome,
};

#[derive(Parser)]
#[command(name = "hover-next", version)]
#[command(about = "HoVer-NeXt: fast nuclei segmentation and classification pipeline", long_about = None)]
#[command(after_help = "Examples:
  # Process a single WSI file
  hover-next --input sample.svs --output_dir results/ --cp lizard_convnextv2_large --tta 4

  # Process multiple files using a glob pattern
  hover-next --input \"/path/to/slides/*.svs\" --output_dir results/ --cp lizard_convnextv2_large

  # Process files listed in a text file
  hover-next --input file_list.txt --output_dir results/ --cp pannuke_convnextv2_tiny_1")]
struct Cli {
    /// Path to configuration file (YAML or JSON); flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Path to WSI/image/npy file, glob pattern (e.g. '/path/*.svs'), or text file containing paths
    #[arg(long, global = true)]
    input: Option<String>,

    /// Output directory where results will be saved
    #[arg(long = "output_dir", alias = "output-dir", global = true)]
    output_dir: Option<PathBuf>,

    /// Model checkpoint id (e.g. 'lizard_convnextv2_large') or comma-separated list for an ensemble
    #[arg(long = "cp", global = true)]
    checkpoints: Option<String>,

    /// Directory containing the checkpoint directories
    #[arg(long = "checkpoint_root", alias = "checkpoint-root", global = true)]
    checkpoint_root: Option<PathBuf>,

    /// Only run the inference step (for splitting GPU/CPU work on clusters)
    #[arg(long = "only_inference", alias = "only-inference", global = true)]
    only_inference: bool,

    /// Metric to optimize post-processing for: 'f1', 'mpq', or 'pannuke'
    #[arg(long, global = true, value_parser = parse_metric)]
    metric: Option<Metric>,

    /// Batch size for inference
    #[arg(long = "batch_size", alias = "batch-size", global = true)]
    batch_size: Option<usize>,

    /// Number of test-time augmentation views
    #[arg(long, global = true)]
    tta: Option<usize>,

    /// Save output as polygon GeoJSON files for QuPath
    #[arg(long = "save_polygon", alias = "save-polygon", global = true)]
    save_polygon: bool,

    /// Tile size in pixels (models are trained on 256x256)
    #[arg(long = "tile_size", alias = "tile-size", global = true)]
    tile_size: Option<usize>,

    /// Overlap between tiles as a fraction (0.96875 for 0.5mpp, 0.9375 for 0.25mpp)
    #[arg(long, global = true)]
    overlap: Option<f64>,

    /// Number of workers for the inference data loader
    #[arg(long = "inf_workers", alias = "inf-workers", global = true)]
    inf_workers: Option<usize>,

    /// Number of writers for the inference data loader
    #[arg(long = "inf_writers", alias = "inf-writers", global = true)]
    inf_writers: Option<usize>,

    /// Tiling factor for post-processing (increase if running out of memory)
    #[arg(long = "pp_tiling", alias = "pp-tiling", global = true)]
    pp_tiling: Option<usize>,

    /// Overlap for post-processing tiles in pixels
    #[arg(long = "pp_overlap", alias = "pp-overlap", global = true)]
    pp_overlap: Option<usize>,

    /// Number of workers for post-processing
    #[arg(long = "pp_workers", alias = "pp-workers", global = true)]
    pp_workers: Option<usize>,

    /// Keep raw prediction stores (can be large, especially for PanNuke)
    #[arg(long = "keep_raw", alias = "keep-raw", global = true)]
    keep_raw: bool,

    /// Cache directory inputs are copied to before processing
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Log failing items and continue with the next one instead of stopping the run
    #[arg(long = "continue_on_error", alias = "continue-on-error", global = true)]
    continue_on_error: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            input: self.input.clone(),
            output_dir: self.output_dir.clone(),
            checkpoints: self.checkpoints.clone(),
            checkpoint_root: self.checkpoint_root.clone(),
            only_inference: self.only_inference,
            metric: self.metric,
            batch_size: self.batch_size,
            tta: self.tta,
            save_polygon: self.save_polygon,
            tile_size: self.tile_size,
            overlap: self.overlap,
            inf_workers: self.inf_workers,
            inf_writers: self.inf_writers,
            pp_tiling: self.pp_tiling,
            pp_overlap: self.pp_overlap,
            pp_workers: self.pp_workers,
            keep_raw: self.keep_raw,
            cache: self.cache.clone(),
            continue_on_error: self.continue_on_error,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Resolve the inputs and show what a run would do, without loading models
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration and checkpoints
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn parse_metric(s: &str) -> std::result::Result<Metric, String> {
    s.parse::<Metric>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Exit code 2 is reserved for inference-only runs
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { EXIT_FAILURE } else { EXIT_SUCCESS });
        }
    };

    let result = match &cli.command {
        None | Some(Commands::Run) => run_command(&cli),
        Some(Commands::Plan { json }) => plan_command(&cli, *json),
        Some(Commands::Validate) => validate_command(&cli),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_overrides(&cli.run.overrides());
    Ok(config)
}

fn report_error(e: &PipelineError) {
    match e {
        PipelineError::Interrupted => eprintln!("\n\n{}", e.hint()),
        PipelineError::Other(inner) => {
            eprintln!("\nUnexpected error occurred: {:#}", inner);
            eprintln!("{}", e.hint());
            eprintln!("{:?}", inner);
        }
        _ => {
            eprintln!("\nError: {}", e);
            eprintln!("{}", e.hint());
        }
    }
}

fn run_command(cli: &Cli) -> Result<u8> {
    let config = load_config(cli)?;
    config.validate()?;

    println!("{}", "=".repeat(80));
    println!("HoVer-NeXt Nuclei Segmentation and Classification Pipeline");
    println!("{}", "=".repeat(80));

    let runtime = build_runtime(config.execution.worker_threads)?;
    let shutdown = CancellationToken::new();

    let result = runtime.block_on(async {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, abandoning current item");
                signal.cancel();
            }
        });
        run_pipeline(config, shutdown.clone()).await
    });

    // Workers were killed on interrupt; a stage that ignored its grace period is not waited for
    runtime.shutdown_background();

    let outcome = result?;
    if let RunOutcome::Completed(stats) = &outcome {
        if stats.failed == 0 {
            println!("\n{}", "=".repeat(80));
            println!("Pipeline completed successfully!");
            println!("{}", "=".repeat(80));
        } else {
            eprintln!("\n{} of {} item(s) failed", stats.failed, stats.total);
        }
    }
    Ok(outcome.exit_code())
}

fn plan_command(cli: &Cli, json: bool) -> Result<u8> {
    let config = load_config(cli)?;
    let plan = plan_run(&config)?;

    if json {
        let out = serde_json::to_string_pretty(&plan).map_err(|e| PipelineError::Other(e.into()))?;
        println!("{}", out);
        return Ok(EXIT_SUCCESS);
    }

    println!("\n=== Run Plan ===");
    for planned in &plan.items {
        let state = match planned.state {
            PlanState::Pending => "pending",
            PlanState::Inferred => "inferred",
            PlanState::Complete => "complete",
        };
        println!(
            "{:>5}  {:<9} {:<4} {}",
            planned.item.index + 1,
            state,
            planned.item.mode,
            planned.item.source
        );
    }
    println!("\n{}", plan);
    println!("Output directory: {}", config.output.dir.display());
    println!("================\n");

    Ok(EXIT_SUCCESS)
}

fn validate_command(cli: &Cli) -> Result<u8> {
    let config = load_config(cli)?;
    config.validate()?;
    tracing::debug!("Effective configuration:\n{}", config.to_yaml()?);

    let ensemble = CheckpointLoader::new().load(&config).map_err(|e| {
        e.downcast::<PipelineError>()
            .unwrap_or_else(|e| PipelineError::ModelLoad(format!("{:#}", e)))
    })?;

    println!("Configuration is valid");
    println!(
        "Ensemble: {} checkpoint(s), dataset {}, {} TTA view(s)",
        ensemble.checkpoints.len(),
        ensemble.dataset().unwrap_or("unknown"),
        ensemble.augmentations.len()
    );
    Ok(EXIT_SUCCESS)
}

/// Commented sample configuration written by `generate-config`.
const SAMPLE_CONFIG: &str = r#"# HoVer-NeXt Pipeline Configuration
# Command-line flags take precedence over the values in this file.

# === INPUT: What to process ===
input:
  # A path, a glob pattern, or a .txt file with one path (or s3:// URI) per line
  spec: "/data/slides/*.svs"

  # Copy each input here before processing (required for s3:// inputs)
  # cache_dir: "/scratch/cache"

  # Delete the cached copy once an item is finished
  evict_cache: false

  # S3 settings for s3:// inputs (credentials come from the environment)
  # s3_region: "us-east-1"
  s3_anonymous: false

# === OUTPUT: One sub-directory per item ===
output:
  dir: "results"

  # Keep raw prediction stores after post-processing (large, especially for PanNuke)
  keep_raw: false

  # Export polygons as GeoJSON for QuPath
  save_polygon: false

  # Zstd compression level (0-22)
  compression_level: 3

# === MODEL: Checkpoints and test-time augmentation ===
model:
  # More than one checkpoint forms an ensemble; all must come from the same dataset
  checkpoints: ["lizard_convnextv2_large"]

  # Directory containing one sub-directory per checkpoint id
  checkpoint_root: "checkpoints"

  # Test-time augmentation views (1-8)
  tta: 4

  batch_size: 64
  color_augmentation: false

# === INFERENCE ===
inference:
  # Models are trained on 256x256 tiles
  tile_size: 256

  # 0.96875 for 0.5mpp, 0.9375 for 0.25mpp
  overlap: 0.96875

  workers: 4
  writers: 2

  # Stop after the first item's inference (exit code 2)
  only_inference: false

# === POST-PROCESSING ===
post_process:
  # f1, mpq or pannuke
  metric: f1

  # Increase if running out of memory
  tiling: 8

  # Overlap in pixels, around the tile size
  overlap: 256

  workers: 16

# === EXECUTION ===
execution:
  # abort: the first failing item ends the run
  # continue: failing items are logged and skipped (exit code 1 at the end)
  on_item_error: abort

  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8

  # Save run metrics as JSON
  # metrics_output_path: "metrics.json"

# === BACKEND: Worker commands running the models ===
backend:
  inference_command: ["hover-next-worker", "infer"]
  post_process_command: ["hover-next-worker", "post-process"]
"#;

fn generate_config_command(output: &Path) -> Result<u8> {
    std::fs::write(output, SAMPLE_CONFIG)
        .map_err(|e| PipelineError::io(format!("writing {}", output.display()), e))?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(EXIT_SUCCESS)
}
