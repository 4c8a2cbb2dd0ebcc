//! Customer360: batch customer analytics CLI
//!
//! This is the main entrypoint that orchestrates data loading, feature
//! computation, model training or loading, offer assignment, and reporting.

use anyhow::Result;
use clap::Parser;
use customer360::data::{write_campaign_summary, write_customer_table};
use customer360::{
    load_ltv_targets, load_transactions, run_pipeline, viz, Args, ChurnModel, LtvModel,
    PipelineConfig, PretrainedModels, CHURN_MODEL_FILE, FEATURE_COLUMNS, LTV_MODEL_FILE,
};
use ndarray::Array2;
use std::path::Path;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from_path(path)?,
        None => PipelineConfig::default(),
    };
    args.apply_to(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if args.verbose {
        println!("Customer360 - RFM, Churn & LTV Analytics");
        println!("========================================\n");
    }

    // Check if in prediction mode
    if let Some(values) = args.parse_feature_values()? {
        run_prediction_mode(&config, values)?;
    } else {
        run_full_pipeline(&args, &config)?;
    }

    Ok(())
}

/// Score a single customer with the saved churn model
fn run_prediction_mode(config: &PipelineConfig, values: [f64; 5]) -> Result<()> {
    println!("=== Prediction Mode ===");
    for (name, value) in FEATURE_COLUMNS.iter().zip(values) {
        println!("  {}: {}", name, value);
    }

    let model_path = Path::new(&config.data.model_dir).join(CHURN_MODEL_FILE);
    let model = ChurnModel::load(&model_path)?;

    let x = Array2::from_shape_vec((1, values.len()), values.to_vec())?;
    let proba = model.predict_proba(x.view(), &FEATURE_COLUMNS)?;

    println!("\n✓ Churn probability: {:.4}", proba[0]);
    println!("  Model: {} ({})", model.model_type, model_path.display());
    Ok(())
}

/// Run the full batch pipeline and write every output
fn run_full_pipeline(args: &Args, config: &PipelineConfig) -> Result<()> {
    println!("=== Customer Analytics Pipeline ===\n");
    let start_time = Instant::now();

    // Step 1: Load and clean transactions
    if args.verbose {
        println!("Step 1: Loading transactions");
        println!("  Input file: {}", config.data.input);
    }
    let transactions = load_transactions(&config.data.input)?;
    println!("✓ Data loaded: {} transactions", transactions.len());

    let ltv_targets = match &args.ltv_target {
        Some(path) => Some(load_ltv_targets(path, &args.ltv_target_column)?),
        None => None,
    };

    // Step 2: Previously saved models
    let model_dir = Path::new(&config.data.model_dir);
    let pretrained = PretrainedModels {
        churn: None,
        ltv: match ltv_targets {
            Some(_) => None,
            None => LtvModel::load_if_present(model_dir.join(LTV_MODEL_FILE))?,
        },
    };

    // Step 3: Features, labels, models and offers
    if args.verbose {
        println!("\nStep 2: Running pipeline");
        println!("  Churn window: {} days", config.churn.window_days);
        println!("  Churn model: {}", config.churn.model_type);
        println!("  Hyperparameter search: {}", config.churn.tune);
    }
    let pipeline_start = Instant::now();
    let output = run_pipeline(config, &transactions, ltv_targets.as_ref(), pretrained)?;
    println!("✓ Pipeline complete: {} customers", output.customers.len());
    if args.verbose {
        println!("  Processing time: {:.2}s", pipeline_start.elapsed().as_secs_f64());
    }

    // Step 4: Persist models and tables
    if let Some(model) = &output.churn_model {
        model.save(model_dir.join(CHURN_MODEL_FILE))?;
    }
    if let Some(training) = &output.ltv_training {
        training.model.save(model_dir.join(LTV_MODEL_FILE))?;
    }
    write_customer_table(&config.data.output, &output.customers)?;
    write_campaign_summary(&config.data.campaign_output, &output.campaign)?;
    info!(output = %config.data.output, campaign = %config.data.campaign_output, "Outputs written");

    // Step 5: Report
    match &args.plot {
        Some(plot) => viz::generate_report(&output, plot)?,
        None => viz::print_statistics(&output),
    }

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    println!("Customer table saved to: {}", config.data.output);
    println!("Campaign summary saved to: {}", config.data.campaign_output);
    println!("Models saved to: {}", model_dir.display());

    Ok(())
}
