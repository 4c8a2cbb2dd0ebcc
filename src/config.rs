//! Run configuration, loadable from TOML and overridden by CLI flags

use anyhow::Context;
use config::{Config, File};
use serde::Deserialize;
use std::path::Path;

/// Complete pipeline configuration
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataConfig,
    pub features: FeatureConfig,
    pub churn: ChurnConfig,
    pub ltv: LtvConfig,
    pub logging: LoggingConfig,
}

/// Input and output locations
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    pub input: String,
    /// Customer table CSV
    pub output: String,
    /// Campaign summary CSV
    pub campaign_output: String,
    /// Directory holding `churn_model.json` and `ltv_model.json`
    pub model_dir: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            input: "data.csv".to_string(),
            output: "customer_features.csv".to_string(),
            campaign_output: "campaign_summary.csv".to_string(),
            model_dir: "models".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FeatureConfig {
    /// "Now" for recency and tenure; max InvoiceDate + 1 day when unset
    pub reference_date: Option<String>,
    /// Limit HistoricalLTV to the last N days of data
    pub ltv_period_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChurnConfig {
    pub window_days: i64,
    /// random_forest or gradient_boosting (alias xgboost)
    pub model_type: String,
    pub test_size: f64,
    pub tune: bool,
    pub cv_folds: usize,
    pub seed: u64,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            window_days: crate::churn::DEFAULT_CHURN_WINDOW_DAYS,
            model_type: "random_forest".to_string(),
            test_size: 0.3,
            tune: false,
            cv_folds: crate::model::DEFAULT_CV_FOLDS,
            seed: crate::model::DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LtvConfig {
    /// linear or random_forest
    pub model_type: String,
    pub test_size: f64,
    pub n_estimators: usize,
    /// Add the churn label as a regressor input
    pub include_churn_label: bool,
    pub seed: u64,
}

impl Default for LtvConfig {
    fn default() -> Self {
        Self {
            model_type: "random_forest".to_string(),
            test_size: 0.2,
            n_estimators: 100,
            include_churn_label: true,
            seed: crate::model::DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.churn.window_days, 90);
        assert_eq!(config.churn.model_type, "random_forest");
        assert_eq!(config.churn.test_size, 0.3);
        assert_eq!(config.ltv.test_size, 0.2);
        assert_eq!(config.churn.seed, 42);
        assert!(!config.churn.tune);
        assert!(config.features.reference_date.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[churn]").unwrap();
        writeln!(file, "window_days = 60").unwrap();
        writeln!(file, "model_type = \"xgboost\"").unwrap();
        writeln!(file, "[ltv]").unwrap();
        writeln!(file, "model_type = \"linear\"").unwrap();
        file.flush().unwrap();

        let config = PipelineConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.churn.window_days, 60);
        assert_eq!(config.churn.model_type, "xgboost");
        assert_eq!(config.churn.test_size, 0.3);
        assert_eq!(config.ltv.model_type, "linear");
        assert_eq!(config.data, DataConfig::default());
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(PipelineConfig::load_from_path("/nonexistent/config.toml").is_err());
    }
}
