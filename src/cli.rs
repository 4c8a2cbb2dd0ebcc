//! Command-line interface definitions and argument parsing

use crate::config::PipelineConfig;
use crate::model::FEATURE_COLUMNS;
use clap::Parser;

/// Customer analytics CLI: RFM segments, churn and LTV models, targeted offers
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transactions CSV file
    #[arg(short, long)]
    pub input: Option<String>,

    /// TOML configuration file; flags below override its values
    #[arg(short, long)]
    pub config: Option<String>,

    /// Output path for the customer table CSV
    #[arg(short, long)]
    pub output: Option<String>,

    /// Output path for the campaign summary CSV
    #[arg(long)]
    pub campaign: Option<String>,

    /// Inactivity window in days after which a customer counts as churned
    #[arg(long)]
    pub churn_window: Option<i64>,

    /// Churn classifier: random_forest or xgboost
    #[arg(long)]
    pub churn_model: Option<String>,

    /// LTV regressor: linear or random_forest
    #[arg(long)]
    pub ltv_model: Option<String>,

    /// Run the cross-validated grid search for the churn model
    #[arg(long)]
    pub tune: bool,

    /// CSV of CustomerID and future-window LTV, used to train the LTV model
    #[arg(long)]
    pub ltv_target: Option<String>,

    /// Column of --ltv-target holding the target value
    #[arg(long, default_value = "LTV")]
    pub ltv_target_column: String,

    /// Date treated as "now", e.g. 2011-12-10
    #[arg(long)]
    pub reference_date: Option<String>,

    /// Directory where models are saved and loaded
    #[arg(long)]
    pub model_dir: Option<String>,

    /// Output path for the segment chart; an importance chart is written beside it
    #[arg(long)]
    pub plot: Option<String>,

    /// Prediction mode: provide recency,frequency,monetary,tenure,aov as a comma-separated string
    /// Example: --predict "30,10,500.0,400,50.0"
    #[arg(short, long)]
    pub predict: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Parse feature values from the predict string, in `FEATURE_COLUMNS` order
    pub fn parse_feature_values(&self) -> crate::Result<Option<[f64; 5]>> {
        let Some(ref predict_str) = self.predict else {
            return Ok(None);
        };

        let parts: Vec<&str> = predict_str.split(',').collect();
        if parts.len() != FEATURE_COLUMNS.len() {
            anyhow::bail!(
                "Predict values must be in format 'recency,frequency,monetary,tenure,aov'"
            );
        }

        let mut values = [0.0; 5];
        for (i, (part, name)) in parts.iter().zip(FEATURE_COLUMNS).enumerate() {
            values[i] = part
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", name, part))?;
        }
        Ok(Some(values))
    }

    /// Fold flag overrides into a loaded or default configuration
    pub fn apply_to(&self, config: &mut PipelineConfig) {
        if let Some(input) = &self.input {
            config.data.input = input.clone();
        }
        if let Some(output) = &self.output {
            config.data.output = output.clone();
        }
        if let Some(campaign) = &self.campaign {
            config.data.campaign_output = campaign.clone();
        }
        if let Some(dir) = &self.model_dir {
            config.data.model_dir = dir.clone();
        }
        if let Some(window) = self.churn_window {
            config.churn.window_days = window;
        }
        if let Some(model) = &self.churn_model {
            config.churn.model_type = model.clone();
        }
        if let Some(model) = &self.ltv_model {
            config.ltv.model_type = model.clone();
        }
        if self.tune {
            config.churn.tune = true;
        }
        if let Some(date) = &self.reference_date {
            config.features.reference_date = Some(date.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feature_values() {
        let mut args = Args {
            predict: Some("30,10,500.0,400,50".to_string()),
            ..Args::default()
        };

        let result = args.parse_feature_values().unwrap();
        assert_eq!(result, Some([30.0, 10.0, 500.0, 400.0, 50.0]));

        args.predict = None;
        assert_eq!(args.parse_feature_values().unwrap(), None);

        args.predict = Some("30,10,500.0".to_string());
        assert!(args.parse_feature_values().is_err());

        args.predict = Some("30,ten,500.0,400,50".to_string());
        assert!(args.parse_feature_values().is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "customer360",
            "--input",
            "tx.csv",
            "--churn-window",
            "60",
            "--churn-model",
            "xgboost",
            "--tune",
        ]);
        let mut config = PipelineConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.data.input, "tx.csv");
        assert_eq!(config.churn.window_days, 60);
        assert_eq!(config.churn.model_type, "xgboost");
        assert!(config.churn.tune);
        assert_eq!(config.ltv.model_type, "random_forest");
    }
}
