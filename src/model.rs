//! Churn classifier: training, evaluation, hyperparameter search and persistence

use crate::ensemble::{
    BoostingParams, ForestParams, GradientBoostedTrees, RandomForest, TreeParams,
};
use crate::error::PipelineError;
use crate::metrics::{roc_auc, ClassificationReport};
use crate::rfm::FeatureTable;
use crate::stats;
use anyhow::Context;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Fixed interface between feature computation and model scoring
pub const FEATURE_COLUMNS: [&str; 5] = [
    "Recency",
    "Frequency",
    "Monetary",
    "TenureDays",
    "AvgOrderValue",
];

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_CV_FOLDS: usize = 5;

/// Ordered feature names a model was trained on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    columns: Vec<String>,
}

impl FeatureSchema {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn columns(&self) -> Vec<&str> {
        self.columns.iter().map(String::as_str).collect()
    }

    /// Fail unless `columns` has exactly this schema's names in this order
    pub fn check(&self, columns: &[&str]) -> crate::Result<()> {
        if self.columns.iter().map(String::as_str).eq(columns.iter().copied()) {
            Ok(())
        } else {
            Err(PipelineError::SchemaMismatch {
                expected: self.columns.clone(),
                actual: columns.iter().map(|c| c.to_string()).collect(),
            }
            .into())
        }
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::new(&FEATURE_COLUMNS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChurnModelType {
    RandomForest,
    GradientBoosting,
}

impl ChurnModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChurnModelType::RandomForest => "random_forest",
            ChurnModelType::GradientBoosting => "gradient_boosting",
        }
    }
}

impl fmt::Display for ChurnModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChurnModelType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random_forest" | "rf" => Ok(ChurnModelType::RandomForest),
            "gradient_boosting" | "xgboost" | "gbm" => Ok(ChurnModelType::GradientBoosting),
            other => Err(PipelineError::UnknownModelType {
                kind: "churn",
                value: other.to_string(),
                expected: "random_forest, gradient_boosting",
            }),
        }
    }
}

/// Hyperparameters of either churn learner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChurnParams {
    RandomForest(ForestParams),
    GradientBoosting(BoostingParams),
}

impl ChurnParams {
    /// Library defaults: 100 trees, unlimited depth, sqrt feature sampling for
    /// the forest; 100 rounds, depth 6, learning rate 0.3 for boosting
    pub fn default_for(model_type: ChurnModelType, n_features: usize, seed: u64) -> Self {
        match model_type {
            ChurnModelType::RandomForest => ChurnParams::RandomForest(ForestParams {
                n_estimators: 100,
                tree: TreeParams {
                    max_features: Some(((n_features as f64).sqrt() as usize).max(1)),
                    ..TreeParams::default()
                },
                bootstrap: true,
                seed,
            }),
            ChurnModelType::GradientBoosting => ChurnParams::GradientBoosting(BoostingParams {
                seed,
                ..BoostingParams::default()
            }),
        }
    }

    pub fn model_type(&self) -> ChurnModelType {
        match self {
            ChurnParams::RandomForest(_) => ChurnModelType::RandomForest,
            ChurnParams::GradientBoosting(_) => ChurnModelType::GradientBoosting,
        }
    }
}

impl fmt::Display for ChurnParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChurnParams::RandomForest(p) => write!(
                f,
                "n_estimators={}, max_depth={}, min_samples_split={}",
                p.n_estimators,
                p.tree.max_depth.map_or("None".to_string(), |d| d.to_string()),
                p.tree.min_samples_split
            ),
            ChurnParams::GradientBoosting(p) => write!(
                f,
                "n_estimators={}, max_depth={}, learning_rate={}",
                p.n_estimators, p.max_depth, p.learning_rate
            ),
        }
    }
}

/// Candidate values swept by the grid search
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<Option<usize>>,
    pub min_samples_split: Vec<usize>,
    pub learning_rate: Vec<f64>,
}

impl ParamGrid {
    pub fn default_for(model_type: ChurnModelType) -> Self {
        match model_type {
            ChurnModelType::RandomForest => Self {
                n_estimators: vec![100, 200],
                max_depth: vec![Some(10), Some(20), None],
                min_samples_split: vec![2, 5],
                learning_rate: Vec::new(),
            },
            ChurnModelType::GradientBoosting => Self {
                n_estimators: vec![100, 200],
                max_depth: vec![Some(3), Some(6), Some(10)],
                min_samples_split: Vec::new(),
                learning_rate: vec![0.01, 0.1],
            },
        }
    }

    /// Every combination applied on top of `base`, in grid order
    pub fn candidates(&self, base: &ChurnParams) -> Vec<ChurnParams> {
        let mut out = Vec::new();
        match base {
            ChurnParams::RandomForest(base) => {
                for &n_estimators in &self.n_estimators {
                    for &max_depth in &self.max_depth {
                        for &min_samples_split in &self.min_samples_split {
                            let mut p = *base;
                            p.n_estimators = n_estimators;
                            p.tree.max_depth = max_depth;
                            p.tree.min_samples_split = min_samples_split;
                            out.push(ChurnParams::RandomForest(p));
                        }
                    }
                }
            }
            ChurnParams::GradientBoosting(base) => {
                for &n_estimators in &self.n_estimators {
                    for &max_depth in &self.max_depth {
                        for &learning_rate in &self.learning_rate {
                            let mut p = *base;
                            p.n_estimators = n_estimators;
                            p.max_depth = max_depth.unwrap_or(base.max_depth);
                            p.learning_rate = learning_rate;
                            out.push(ChurnParams::GradientBoosting(p));
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum ChurnEstimator {
    RandomForest(RandomForest),
    GradientBoosting(GradientBoostedTrees),
}

impl ChurnEstimator {
    fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        match self {
            ChurnEstimator::RandomForest(m) => m.predict(x),
            ChurnEstimator::GradientBoosting(m) => m.predict_proba(x),
        }
    }

    fn feature_importances(&self) -> &[f64] {
        match self {
            ChurnEstimator::RandomForest(m) => m.feature_importances(),
            ChurnEstimator::GradientBoosting(m) => m.feature_importances(),
        }
    }
}

/// Fitted churn classifier with the feature order it expects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnModel {
    pub model_type: ChurnModelType,
    pub schema: FeatureSchema,
    pub params: ChurnParams,
    estimator: ChurnEstimator,
}

impl ChurnModel {
    /// Churned probability per row; `columns` must match the training schema
    pub fn predict_proba(
        &self,
        x: ArrayView2<f64>,
        columns: &[&str],
    ) -> crate::Result<Array1<f64>> {
        self.schema.check(columns)?;
        Ok(self.estimator.predict_proba(x))
    }

    /// Hard labels at the 0.5 cut
    pub fn predict(&self, x: ArrayView2<f64>, columns: &[&str]) -> crate::Result<Vec<u8>> {
        Ok(self
            .predict_proba(x, columns)?
            .iter()
            .map(|&p| (p > 0.5) as u8)
            .collect())
    }

    /// Score every customer of a feature table using the schema's columns
    pub fn predict_table(&self, table: &FeatureTable) -> crate::Result<Vec<f64>> {
        let columns = self.schema.columns();
        let x = prepare_features(table, &columns)?;
        Ok(self.predict_proba(x.view(), &columns)?.to_vec())
    }

    /// Feature importances, highest first
    pub fn feature_importances(&self) -> Vec<(String, f64)> {
        rank_importances(&self.schema, self.estimator.feature_importances())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        save_json(self, path.as_ref())?;
        info!(path = %path.as_ref().display(), "Churn model saved");
        Ok(())
    }

    /// Load a saved model; a missing file is reported as `ModelUnavailable`
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let model = load_json(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Churn model loaded");
        Ok(model)
    }

    /// `Ok(None)` when the file does not exist, an error when it is unreadable
    pub fn load_if_present<P: AsRef<Path>>(path: P) -> crate::Result<Option<Self>> {
        if path.as_ref().exists() {
            Self::load(path).map(Some)
        } else {
            warn!(path = %path.as_ref().display(), "Churn model not found");
            Ok(None)
        }
    }
}

pub(crate) fn rank_importances(schema: &FeatureSchema, values: &[f64]) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = schema
        .columns
        .iter()
        .cloned()
        .zip(values.iter().copied())
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

pub(crate) fn save_json<T: Serialize>(value: &T, path: &Path) -> crate::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, value)
        .with_context(|| format!("Failed to write model to {}", path.display()))?;
    Ok(())
}

pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> crate::Result<T> {
    if !path.exists() {
        return Err(PipelineError::ModelUnavailable(path.to_path_buf()).into());
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
        .with_context(|| format!("Failed to read model from {}", path.display()))
}

/// Fill NaN entries with their column median
///
/// Returns how many values were filled. A column with no observed value is fatal.
pub fn impute_median(x: &mut Array2<f64>, columns: &[&str]) -> crate::Result<usize> {
    let mut filled = 0;
    for (j, mut column) in x.axis_iter_mut(Axis(1)).enumerate() {
        let missing = column.iter().filter(|v| v.is_nan()).count();
        if missing == 0 {
            continue;
        }
        let values: Vec<f64> = column.iter().copied().collect();
        let name = columns.get(j).copied().unwrap_or("?");
        let median = stats::median(&values)?
            .ok_or_else(|| PipelineError::AllMissingFeature(name.to_string()))?;
        column.iter_mut().filter(|v| v.is_nan()).for_each(|v| *v = median);
        filled += missing;
    }
    if filled > 0 {
        warn!(filled, "Missing values found in features, filled with column median");
    }
    Ok(filled)
}

/// Feature matrix of `columns` with median imputation applied
pub fn prepare_features(table: &FeatureTable, columns: &[&str]) -> crate::Result<Array2<f64>> {
    let mut x = table.matrix(columns)?;
    impute_median(&mut x, columns)?;
    Ok(x)
}

/// Row indices of a held-out evaluation split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainTestSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

fn class_indices(labels: &[u8]) -> [Vec<usize>; 2] {
    let mut classes = [Vec::new(), Vec::new()];
    for (i, &l) in labels.iter().enumerate() {
        classes[(l > 0) as usize].push(i);
    }
    classes
}

/// Split preserving the label ratio in both halves
pub fn stratified_split(labels: &[u8], test_size: f64, seed: u64) -> crate::Result<TrainTestSplit> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for (class, mut members) in class_indices(labels).into_iter().enumerate() {
        if members.len() < 2 {
            return Err(PipelineError::InsufficientData(format!(
                "class {} has {} member(s); at least 2 are needed to stratify",
                class,
                members.len()
            ))
            .into());
        }
        members.shuffle(&mut rng);
        let n_test = ((members.len() as f64 * test_size).round() as usize)
            .clamp(1, members.len() - 1);
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    Ok(TrainTestSplit { train, test })
}

/// Plain shuffled split for regression targets
pub fn shuffled_split(n: usize, test_size: f64, seed: u64) -> crate::Result<TrainTestSplit> {
    if n < 2 {
        return Err(PipelineError::InsufficientData(format!("{} row(s) cannot be split", n)).into());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);

    let n_test = ((n as f64 * test_size).ceil() as usize).clamp(1, n - 1);
    let mut test = indices[..n_test].to_vec();
    let mut train = indices[n_test..].to_vec();
    train.sort_unstable();
    test.sort_unstable();
    Ok(TrainTestSplit { train, test })
}

/// Validation folds, each holding members of both classes
pub fn stratified_folds(labels: &[u8], k: usize, seed: u64) -> crate::Result<Vec<Vec<usize>>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];

    for (class, mut members) in class_indices(labels).into_iter().enumerate() {
        if members.len() < k {
            return Err(PipelineError::InsufficientData(format!(
                "class {} has {} member(s), fewer than {} folds",
                class,
                members.len(),
                k
            ))
            .into());
        }
        members.shuffle(&mut rng);
        for (i, idx) in members.into_iter().enumerate() {
            folds[i % k].push(idx);
        }
    }

    folds.iter_mut().for_each(|f| f.sort_unstable());
    Ok(folds)
}

fn fit_estimator(
    x: ArrayView2<f64>,
    labels: &[u8],
    params: &ChurnParams,
) -> crate::Result<(ChurnEstimator, ChurnParams)> {
    let y: Vec<f64> = labels.iter().map(|&l| l as f64).collect();
    let n_pos = labels.iter().filter(|&&l| l > 0).count();
    let n_neg = labels.len() - n_pos;

    match params {
        ChurnParams::RandomForest(p) => {
            // balanced class weights: n / (2 * n_class)
            let n = labels.len() as f64;
            let w_pos = if n_pos > 0 { n / (2.0 * n_pos as f64) } else { 1.0 };
            let w_neg = if n_neg > 0 { n / (2.0 * n_neg as f64) } else { 1.0 };
            let weights: Vec<f64> = labels
                .iter()
                .map(|&l| if l > 0 { w_pos } else { w_neg })
                .collect();
            let forest = RandomForest::fit(x, &y, &weights, p)?;
            Ok((ChurnEstimator::RandomForest(forest), *params))
        }
        ChurnParams::GradientBoosting(p) => {
            let mut p = *p;
            p.scale_pos_weight = if n_pos > 0 { n_neg as f64 / n_pos as f64 } else { 1.0 };
            let model = GradientBoostedTrees::fit(x, &y, &p)?;
            Ok((ChurnEstimator::GradientBoosting(model), ChurnParams::GradientBoosting(p)))
        }
    }
}

fn cross_val_auc(
    x: ArrayView2<f64>,
    labels: &[u8],
    folds: &[Vec<usize>],
    params: &ChurnParams,
) -> crate::Result<f64> {
    let mut scores = Vec::with_capacity(folds.len());
    for fold in folds {
        let train: Vec<usize> = (0..labels.len())
            .filter(|i| fold.binary_search(i).is_err())
            .collect();
        let x_train = x.select(Axis(0), &train);
        let y_train: Vec<u8> = train.iter().map(|&i| labels[i]).collect();
        let x_val = x.select(Axis(0), fold);
        let y_val: Vec<u8> = fold.iter().map(|&i| labels[i]).collect();

        let (estimator, _) = fit_estimator(x_train.view(), &y_train, params)?;
        let proba = estimator.predict_proba(x_val.view()).to_vec();
        if let Some(auc) = roc_auc(&y_val, &proba)? {
            scores.push(auc);
        }
    }
    Ok(Array1::from(scores).mean().unwrap_or(f64::NAN))
}

/// Outcome of the cross-validated grid search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub best_params: ChurnParams,
    pub best_score: f64,
    /// Every candidate with its mean validation ROC-AUC, in grid order
    pub candidates: Vec<(ChurnParams, f64)>,
}

/// Evaluate every candidate with k-fold ROC-AUC, in parallel
pub fn grid_search(
    x: ArrayView2<f64>,
    labels: &[u8],
    candidates: Vec<ChurnParams>,
    folds: usize,
    seed: u64,
) -> crate::Result<SearchResult> {
    if candidates.is_empty() {
        anyhow::bail!("grid search needs at least one candidate");
    }
    let fold_sets = stratified_folds(labels, folds, seed)?;

    let scores: Vec<f64> = candidates
        .par_iter()
        .map(|params| cross_val_auc(x, labels, &fold_sets, params))
        .collect::<crate::Result<Vec<f64>>>()?;

    // first candidate wins ties so results do not depend on scheduling
    let mut best = 0;
    for (i, &score) in scores.iter().enumerate() {
        if score > scores[best] || (scores[best].is_nan() && !score.is_nan()) {
            best = i;
        }
    }

    let result = SearchResult {
        best_params: candidates[best],
        best_score: scores[best],
        candidates: candidates.into_iter().zip(scores).collect(),
    };
    info!(best = %result.best_params, roc_auc = result.best_score, "Grid search complete");
    Ok(result)
}

#[derive(Debug, Clone)]
pub struct ChurnTrainingConfig {
    pub model_type: ChurnModelType,
    pub tune: bool,
    pub test_size: f64,
    pub seed: u64,
    pub cv_folds: usize,
    /// Overrides the default grid when tuning
    pub grid: Option<ParamGrid>,
}

impl Default for ChurnTrainingConfig {
    fn default() -> Self {
        Self {
            model_type: ChurnModelType::RandomForest,
            tune: false,
            test_size: 0.3,
            seed: DEFAULT_SEED,
            cv_folds: DEFAULT_CV_FOLDS,
            grid: None,
        }
    }
}

/// Everything downstream reporting needs from a training run
#[derive(Debug, Clone)]
pub struct ChurnTrainingOutput {
    pub model: ChurnModel,
    pub importances: Vec<(String, f64)>,
    pub split: TrainTestSplit,
    pub report: ClassificationReport,
    pub roc_auc: Option<f64>,
    pub search: Option<SearchResult>,
}

/// Train and evaluate a churn classifier
///
/// # Arguments
/// * `x` - Feature matrix, one row per customer, NaN for missing values
/// * `columns` - Names of `x`'s columns, in order
/// * `labels` - Binary churn labels aligned with the rows of `x`
/// * `config` - Learner, split and tuning settings
pub fn train_churn_model(
    x: &Array2<f64>,
    columns: &[&str],
    labels: &[u8],
    config: &ChurnTrainingConfig,
) -> crate::Result<ChurnTrainingOutput> {
    if x.nrows() != labels.len() {
        anyhow::bail!("{} feature rows but {} labels", x.nrows(), labels.len());
    }
    if x.ncols() != columns.len() {
        anyhow::bail!("{} feature columns but {} names", x.ncols(), columns.len());
    }
    info!(model_type = %config.model_type, rows = x.nrows(), "Training churn model");

    let mut x = x.clone();
    impute_median(&mut x, columns)?;

    let split = stratified_split(labels, config.test_size, config.seed)?;
    let x_train = x.select(Axis(0), &split.train);
    let y_train: Vec<u8> = split.train.iter().map(|&i| labels[i]).collect();
    let x_test = x.select(Axis(0), &split.test);
    let y_test: Vec<u8> = split.test.iter().map(|&i| labels[i]).collect();

    let default_params = ChurnParams::default_for(config.model_type, columns.len(), config.seed);
    let search = if config.tune {
        let grid = config
            .grid
            .clone()
            .unwrap_or_else(|| ParamGrid::default_for(config.model_type));
        let result = grid_search(
            x_train.view(),
            &y_train,
            grid.candidates(&default_params),
            config.cv_folds,
            config.seed,
        )?;
        Some(result)
    } else {
        None
    };
    let params = search.as_ref().map_or(default_params, |s| s.best_params);

    let (estimator, params) = fit_estimator(x_train.view(), &y_train, &params)?;
    let model = ChurnModel {
        model_type: config.model_type,
        schema: FeatureSchema::new(columns),
        params,
        estimator,
    };

    let proba = model.predict_proba(x_test.view(), columns)?;
    let predicted: Vec<u8> = proba.iter().map(|&p| (p > 0.5) as u8).collect();
    let report = ClassificationReport::new(&y_test, &predicted)?;
    let auc = roc_auc(&y_test, &proba.to_vec())?;
    let importances = model.feature_importances();

    info!("Classification report:\n{}", report);
    info!(roc_auc = ?auc, "Churn model evaluated");
    info!(top = ?importances.iter().take(5).collect::<Vec<_>>(), "Feature importances");

    Ok(ChurnTrainingOutput {
        model,
        importances,
        split,
        report,
        roc_auc: auc,
        search,
    })
}
