#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use dipstat::assemble::{OutputRow, PredictionReport};
use dipstat::config::PipelineConfig;
use dipstat::data::{ConsistencyWarning, SchemaCoercion};
use dipstat::filter::ExclusionReport;
use dipstat::model::{ArtifactMetadata, ModelError};
use dipstat::pipeline::Predictor;
use dipstat::stage::DipStage;
use dipstat::store::{ArtifactStore, DEFAULT_MODEL_VERSION};

#[derive(Args)]
pub struct PredictArgs {
    /// Path to a TSV (or .csv) file with ID,TREM_1,IL_6,Procalcitonin columns in pg/mL
    pub input: PathBuf,

    /// Pipeline configuration file (.toml); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root directory of the versioned model artifacts
    #[arg(long)]
    pub models: Option<PathBuf>,

    /// Where to write the output table
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Pipeline configuration file (.toml); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root directory of the versioned model artifacts
    #[arg(long)]
    pub models: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "dipstat",
    about = "DIP stage and cDIP score inference from TREM-1, IL-6 and procalcitonin",
    long_about = "Classifies patients into the ordered DIP1/DIP2/DIP3 immune dysregulation stages, \
                 or scores them on the continuous cDIP scale, using frozen tree-ensemble models."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign a DIP stage to every record
    #[command(about = "Predict DIP stages (outputs: dip_predictions.tsv)")]
    Stage(PredictArgs),

    /// Compute the continuous cDIP score for every record
    #[command(about = "Predict cDIP scores (outputs: cdip_predictions.tsv)")]
    Score(PredictArgs),

    /// Show what the model artifacts contain
    #[command(about = "Print model artifact metadata")]
    Inspect(InspectArgs),

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Stage(args)) => run_stage(args),
        Some(Commands::Score(args)) => run_score(args),
        Some(Commands::Inspect(args)) => run_inspect(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(
    config: Option<&Path>,
    models: Option<PathBuf>,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            PipelineConfig::load(path)?
        }
        None => PipelineConfig::default(),
    };
    if models.is_some() {
        config.artifacts.root = models;
    }
    Ok(config)
}

fn report_diagnostics<R: OutputRow>(report: &PredictionReport<R>) {
    let PredictionReport {
        exclusions,
        coercions,
        warnings,
        ..
    } = report;
    print_coercions(coercions);
    print_warnings(warnings);
    print_exclusions(exclusions);
}

fn print_coercions(coercions: &[SchemaCoercion]) {
    for coercion in coercions {
        println!("Note: {coercion}");
    }
}

fn print_warnings(warnings: &[ConsistencyWarning]) {
    for warning in warnings {
        println!("Warning: {warning}");
    }
}

fn print_exclusions(exclusions: &ExclusionReport) {
    if exclusions.is_empty() {
        println!("No records were excluded for missing predictors.");
    } else {
        println!("Warning: {exclusions}");
    }
}

fn run_stage(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref(), args.models)?;
    let predictor = Predictor::new(config)?;

    println!("Loading biomarker data from: {}", args.input.display());
    let result = predictor.predict_stage_file(&args.input)?;
    report_diagnostics(&result);

    let counts = result.stage_counts();
    println!("Predicted DIP stages for {} records", result.len());
    for stage in DipStage::ALL {
        println!("  {stage}: {}", counts[stage.index()]);
    }

    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from("dip_predictions.tsv"));
    result.write_tsv(&output_path)?;
    println!("Predictions saved to: {}", output_path.display());
    Ok(())
}

fn run_score(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref(), args.models)?;
    let predictor = Predictor::new(config)?;

    println!("Loading biomarker data from: {}", args.input.display());
    let result = predictor.predict_score_file(&args.input)?;
    report_diagnostics(&result);

    println!("Computed cDIP scores for {} records", result.len());

    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from("cdip_predictions.tsv"));
    result.write_tsv(&output_path)?;
    println!("Predictions saved to: {}", output_path.display());
    Ok(())
}

fn print_metadata(kind: &str, metadata: &ArtifactMetadata, n_trees: usize, max_depth: usize) {
    println!("{kind}: {} ({})", metadata.name, metadata.version);
    println!("  Features: {}", metadata.features.join(", "));
    println!("  Trees: {n_trees} (max depth {max_depth})");
    if !metadata.description.is_empty() {
        println!("  {}", metadata.description);
    }
}

fn run_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref(), args.models)?;
    let store = ArtifactStore::from_config(&config.artifacts);
    println!("Model directory: {}", store.dir().display());

    let classifier = store.classifier()?;
    let depth = classifier.trees.iter().map(|t| t.depth()).max().unwrap_or(0);
    print_metadata("Classifier", &classifier.metadata, classifier.trees.len(), depth);
    println!("  Classes: {}", classifier.classes.join(", "));

    match store.regressor() {
        Ok(regressor) => {
            let depth = regressor.trees.iter().map(|t| t.depth()).max().unwrap_or(0);
            print_metadata("Regressor", &regressor.metadata, regressor.trees.len(), depth);
            println!(
                "  Link: {:?}, base score {}, learning rate {}",
                regressor.link, regressor.base_score, regressor.learning_rate
            );
        }
        // The regressor may be served by an external program instead.
        Err(ModelError::ArtifactMissing { path }) => {
            println!("Regressor: no artifact at {}", path.display());
        }
        Err(e) => return Err(Box::new(e)),
    }
    Ok(())
}

fn print_version_info() {
    println!("dipstat {}", env!("CARGO_PKG_VERSION"));
    println!("Default model version: {DEFAULT_MODEL_VERSION}");
}
