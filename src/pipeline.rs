//! End-to-end batch run: features, labels, models, offers and campaign rollup
//!
//! Everything is computed in memory and handed back only when every stage
//! succeeded, so callers never see a partially scored table.

use crate::churn::{label_churn, ChurnLabels};
use crate::config::PipelineConfig;
use crate::data::{parse_reference_date, Transaction};
use crate::error::PipelineError;
use crate::ltv::{
    align_targets, historical_ltv, ltv_feature_matrix, train_ltv_model, LtvModel, LtvModelType,
    LtvTrainingConfig, LtvTrainingOutput,
};
use crate::model::{
    prepare_features, train_churn_model, ChurnModel, ChurnModelType, ChurnTrainingConfig,
    ChurnTrainingOutput, FEATURE_COLUMNS,
};
use crate::offers::{campaign_summary, recommend, CampaignRow, LtvThresholds, Offer, OfferContext};
use crate::rfm::{compute_rfm, CustomerFeatures, FeatureTable};
use ndarray::Axis;
use std::collections::HashMap;
use tracing::{info, warn};

/// A feature row with model outputs and the chosen offer attached
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCustomer {
    pub features: CustomerFeatures,
    pub churn_label: u8,
    pub churn_prob: f64,
    /// Predicted LTV over the target window; 0 when no LTV model is available
    pub predicted_ltv: f64,
    pub offer: Offer,
}

/// Previously saved models to score with instead of training
#[derive(Debug, Clone, Default)]
pub struct PretrainedModels {
    pub churn: Option<ChurnModel>,
    pub ltv: Option<LtvModel>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub features: FeatureTable,
    pub churn_labels: ChurnLabels,
    /// `None` when a pre-trained churn model was used or none could be trained
    pub churn_training: Option<ChurnTrainingOutput>,
    /// `None` when the labels hold a single class; every ChurnProb is then 0
    pub churn_model: Option<ChurnModel>,
    pub ltv_training: Option<LtvTrainingOutput>,
    pub ltv_model: Option<LtvModel>,
    pub customers: Vec<ScoredCustomer>,
    pub thresholds: LtvThresholds,
    pub campaign: Vec<CampaignRow>,
}

/// Run every stage over cleaned transactions
///
/// # Arguments
/// * `config` - Run settings; model type names are validated before any work
/// * `transactions` - Cleaned transactions
/// * `ltv_targets` - Future-window LTV per customer; enables LTV training
/// * `pretrained` - Saved models; a churn model here skips churn training
pub fn run_pipeline(
    config: &PipelineConfig,
    transactions: &[Transaction],
    ltv_targets: Option<&HashMap<String, f64>>,
    pretrained: PretrainedModels,
) -> crate::Result<PipelineOutput> {
    let churn_type: ChurnModelType = config.churn.model_type.parse()?;
    let ltv_type: LtvModelType = config.ltv.model_type.parse()?;
    let reference_date = config
        .features
        .reference_date
        .as_deref()
        .map(parse_reference_date)
        .transpose()?;

    let mut features = compute_rfm(transactions, reference_date)?;
    let ltv_period_days = config.features.ltv_period_days;
    features.set_historical_ltv(&historical_ltv(transactions, ltv_period_days)?);

    let window_days = config.churn.window_days;
    let churn_labels = label_churn(transactions, &features, window_days, reference_date)?;

    let (churn_model, churn_training) = match pretrained.churn {
        Some(model) => {
            info!(model_type = %model.model_type, "Scoring with pre-trained churn model");
            (Some(model), None)
        }
        None => {
            let x = prepare_features(&features, &FEATURE_COLUMNS)?;
            let trained = train_churn_model(
                &x,
                &FEATURE_COLUMNS,
                &churn_labels.labels,
                &ChurnTrainingConfig {
                    model_type: churn_type,
                    tune: config.churn.tune,
                    test_size: config.churn.test_size,
                    seed: config.churn.seed,
                    cv_folds: config.churn.cv_folds,
                    grid: None,
                },
            );
            match trained {
                Ok(training) => (Some(training.model.clone()), Some(training)),
                Err(err) => match err.downcast_ref::<PipelineError>() {
                    Some(PipelineError::InsufficientData(reason)) => {
                        warn!(%reason, "Churn model not trained, churn probability set to 0");
                        (None, None)
                    }
                    _ => return Err(err),
                },
            }
        }
    };
    let churn_probs = match &churn_model {
        Some(model) => model.predict_table(&features)?,
        None => vec![0.0; features.len()],
    };

    let (ltv_model, ltv_training) = match ltv_targets {
        Some(targets) => {
            let labels = config
                .ltv
                .include_churn_label
                .then_some(churn_labels.labels.as_slice());
            let (x, columns) = ltv_feature_matrix(&features, labels)?;
            let (rows, y) = align_targets(&features, targets);
            let training = train_ltv_model(
                &x.select(Axis(0), &rows),
                &columns,
                &y,
                &LtvTrainingConfig {
                    model_type: ltv_type,
                    test_size: config.ltv.test_size,
                    seed: config.ltv.seed,
                    n_estimators: config.ltv.n_estimators,
                },
            )?;
            (Some(training.model.clone()), Some(training))
        }
        None => (pretrained.ltv, None),
    };
    let predicted_ltv = match &ltv_model {
        Some(model) => model.predict_table(&features, Some(&churn_labels.labels))?,
        None => {
            warn!("No LTV target or saved LTV model, predicted LTV set to 0");
            vec![0.0; features.len()]
        }
    };

    let historical: Vec<f64> = features.customers.iter().map(|c| c.historical_ltv).collect();
    let thresholds = LtvThresholds::from_historical(&historical)?;

    let customers: Vec<ScoredCustomer> = features
        .customers
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let context = OfferContext {
                segment: c.segment,
                churn_prob: churn_probs[i],
                historical_ltv: c.historical_ltv,
                predicted_ltv: predicted_ltv[i],
            };
            ScoredCustomer {
                features: c.clone(),
                churn_label: churn_labels.labels[i],
                churn_prob: churn_probs[i],
                predicted_ltv: predicted_ltv[i],
                offer: recommend(&context, &thresholds),
            }
        })
        .collect();
    let campaign = campaign_summary(&customers)?;

    info!(customers = customers.len(), offers = campaign.len(), "Pipeline complete");
    Ok(PipelineOutput {
        features,
        churn_labels,
        churn_training,
        churn_model,
        ltv_training,
        ltv_model,
        customers,
        thresholds,
        campaign,
    })
}
