//! Customer360: customer analytics over retail transactions
//!
//! This library turns raw transactions into RFM scores and segments, churn
//! labels and probabilities, predicted lifetime value, and a rule-based
//! marketing offer per customer with a campaign cost rollup.

pub mod churn;
pub mod cli;
pub mod config;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod ltv;
pub mod metrics;
pub mod model;
pub mod offers;
pub mod pipeline;
pub mod rfm;
pub mod stats;
pub mod viz;

// Re-export public items for easier access
pub use churn::{label_churn, ChurnLabels};
pub use cli::Args;
pub use config::PipelineConfig;
pub use data::{load_ltv_targets, load_transactions, Transaction};
pub use error::PipelineError;
pub use ltv::{historical_ltv, LtvModel, LtvModelType};
pub use model::{ChurnModel, ChurnModelType, FeatureSchema, FEATURE_COLUMNS};
pub use offers::{campaign_summary, recommend, CampaignRow, Offer};
pub use pipeline::{run_pipeline, PipelineOutput, PretrainedModels, ScoredCustomer};
pub use rfm::{compute_rfm, CustomerFeatures, FeatureTable, Segment};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;

/// File name of the saved churn model inside the model directory
pub const CHURN_MODEL_FILE: &str = "churn_model.json";

/// File name of the saved LTV model inside the model directory
pub const LTV_MODEL_FILE: &str = "ltv_model.json";
