//! Customer lifetime value: realized spend and the predictive regressor

use crate::data::{
    f64_values, max_invoice_date, str_values, to_millis, transactions_frame, Transaction,
    CUSTOMER_ID, INVOICE_MS, TOTAL_PRICE,
};
use crate::error::PipelineError;
use crate::metrics::RegressionMetrics;
use crate::model::{
    impute_median, load_json, rank_importances, save_json, shuffled_split, FeatureSchema,
    TrainTestSplit, DEFAULT_SEED, FEATURE_COLUMNS,
};
use crate::rfm::FeatureTable;
use chrono::Duration;
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::{col, lit, IntoLazy};
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Optional extra regressor input: the customer's churn label
pub const CHURN_LABEL_COLUMN: &str = "ChurnLabel";

/// Total spend per customer, optionally limited to the last `period_days`
/// before the latest transaction
pub fn historical_ltv(
    transactions: &[Transaction],
    period_days: Option<i64>,
) -> crate::Result<HashMap<String, f64>> {
    let mut frame = transactions_frame(transactions)?.lazy();
    match (period_days, max_invoice_date(transactions)) {
        (Some(days), Some(end)) => {
            let start = end - Duration::days(days);
            info!(period_days = days, %start, %end, "Calculating windowed historical LTV");
            frame = frame.filter(col(INVOICE_MS).gt_eq(lit(to_millis(start))));
        }
        _ => info!("Calculating historical LTV over entire dataset"),
    }

    let totals = frame
        .group_by([col(CUSTOMER_ID)])
        .agg([col(TOTAL_PRICE).sum().alias("HistoricalLTV")])
        .collect()?;

    let ids = str_values(&totals, CUSTOMER_ID)?;
    let values = f64_values(&totals, "HistoricalLTV")?;
    Ok(ids.into_iter().zip(values).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LtvModelType {
    Linear,
    RandomForest,
}

impl LtvModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LtvModelType::Linear => "linear",
            LtvModelType::RandomForest => "random_forest",
        }
    }
}

impl fmt::Display for LtvModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LtvModelType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(LtvModelType::Linear),
            "random_forest" | "rf" => Ok(LtvModelType::RandomForest),
            other => Err(PipelineError::UnknownModelType {
                kind: "LTV",
                value: other.to_string(),
                expected: "linear, random_forest",
            }),
        }
    }
}

/// Regressor inputs: the five churn features, plus `ChurnLabel` when labels are given
pub fn ltv_feature_matrix(
    table: &FeatureTable,
    churn_labels: Option<&[u8]>,
) -> crate::Result<(Array2<f64>, Vec<&'static str>)> {
    let mut columns: Vec<&'static str> = FEATURE_COLUMNS.to_vec();
    let mut x = table.matrix(&columns)?;

    if let Some(labels) = churn_labels {
        if labels.len() != table.len() {
            anyhow::bail!(
                "{} churn labels for {} customers",
                labels.len(),
                table.len()
            );
        }
        let label_column = Array1::from_iter(labels.iter().map(|&l| l as f64));
        x.push_column(label_column.view())?;
        columns.push(CHURN_LABEL_COLUMN);
    }
    Ok((x, columns))
}

/// Rows of `table` that have a target, and the targets in that order
pub fn align_targets(
    table: &FeatureTable,
    targets: &HashMap<String, f64>,
) -> (Vec<usize>, Array1<f64>) {
    let mut rows = Vec::new();
    let mut y = Vec::new();
    for (i, c) in table.customers.iter().enumerate() {
        if let Some(&value) = targets.get(&c.customer_id) {
            rows.push(i);
            y.push(value);
        }
    }
    if rows.len() < table.len() {
        warn!(
            without_target = table.len() - rows.len(),
            "Customers without an LTV target are left out of training"
        );
    }
    (rows, Array1::from(y))
}

/// Ordinary least squares coefficients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    coefficients: Vec<f64>,
    intercept: f64,
}

impl LinearModel {
    /// Constant columns are left out of the solve and get a zero coefficient
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>) -> crate::Result<Self> {
        let varying: Vec<usize> = x
            .axis_iter(Axis(1))
            .enumerate()
            .filter(|(_, col)| {
                let first = col[0];
                col.iter().any(|&v| v != first)
            })
            .map(|(j, _)| j)
            .collect();

        let mut coefficients = vec![0.0; x.ncols()];
        if varying.is_empty() {
            let intercept = y.mean().unwrap_or(0.0);
            return Ok(Self { coefficients, intercept });
        }

        let dataset = Dataset::new(x.select(Axis(1), &varying), y.to_owned());
        let fitted = LinearRegression::new().fit(&dataset)?;
        for (&j, &c) in varying.iter().zip(fitted.params()) {
            coefficients[j] = c;
        }
        Ok(Self {
            coefficients,
            intercept: fitted.intercept(),
        })
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&Array1::from(self.coefficients.clone())) + self.intercept
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

type ForestRegressor = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LtvEstimator {
    Linear(LinearModel),
    RandomForest(Arc<ForestRegressor>),
}

fn dense_matrix(x: ArrayView2<f64>) -> DenseMatrix<f64> {
    DenseMatrix::new(x.nrows(), x.ncols(), x.iter().copied().collect(), false)
}

/// Fitted LTV regressor with the feature order it expects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtvModel {
    pub model_type: LtvModelType,
    pub schema: FeatureSchema,
    estimator: LtvEstimator,
}

impl LtvModel {
    pub fn predict(&self, x: ArrayView2<f64>, columns: &[&str]) -> crate::Result<Array1<f64>> {
        self.schema.check(columns)?;
        Ok(match &self.estimator {
            LtvEstimator::Linear(m) => m.predict(x),
            LtvEstimator::RandomForest(m) => Array1::from(m.predict(&dense_matrix(x))?),
        })
    }

    /// Whether the model was trained with the churn label as an input
    pub fn uses_churn_label(&self) -> bool {
        self.schema.columns().contains(&CHURN_LABEL_COLUMN)
    }

    /// Predict for every customer of `table`
    ///
    /// `churn_labels` is only read when the model was trained with them.
    pub fn predict_table(
        &self,
        table: &FeatureTable,
        churn_labels: Option<&[u8]>,
    ) -> crate::Result<Vec<f64>> {
        let labels = if self.uses_churn_label() {
            churn_labels
        } else {
            None
        };
        let (mut x, columns) = ltv_feature_matrix(table, labels)?;
        impute_median(&mut x, &columns)?;
        Ok(self.predict(x.view(), &columns)?.to_vec())
    }

    /// Coefficient magnitudes for the linear model; the forest reports none
    pub fn feature_importances(&self) -> Option<Vec<(String, f64)>> {
        match &self.estimator {
            LtvEstimator::Linear(m) => {
                let magnitudes: Vec<f64> = m.coefficients().iter().map(|c| c.abs()).collect();
                Some(rank_importances(&self.schema, &magnitudes))
            }
            LtvEstimator::RandomForest(_) => None,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        save_json(self, path.as_ref())?;
        info!(path = %path.as_ref().display(), "LTV model saved");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let model = load_json(path.as_ref())?;
        info!(path = %path.as_ref().display(), "LTV model loaded");
        Ok(model)
    }

    pub fn load_if_present<P: AsRef<Path>>(path: P) -> crate::Result<Option<Self>> {
        if path.as_ref().exists() {
            Self::load(path).map(Some)
        } else {
            warn!(path = %path.as_ref().display(), "LTV model not found");
            Ok(None)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LtvTrainingConfig {
    pub model_type: LtvModelType,
    pub test_size: f64,
    pub seed: u64,
    pub n_estimators: usize,
}

impl Default for LtvTrainingConfig {
    fn default() -> Self {
        Self {
            model_type: LtvModelType::RandomForest,
            test_size: 0.2,
            seed: DEFAULT_SEED,
            n_estimators: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LtvTrainingOutput {
    pub model: LtvModel,
    pub split: TrainTestSplit,
    pub metrics: RegressionMetrics,
}

/// Fit an LTV regressor on a random split and report held-out error
pub fn train_ltv_model(
    x: &Array2<f64>,
    columns: &[&str],
    y: &Array1<f64>,
    config: &LtvTrainingConfig,
) -> crate::Result<LtvTrainingOutput> {
    if x.nrows() != y.len() {
        anyhow::bail!("{} feature rows but {} targets", x.nrows(), y.len());
    }
    if x.ncols() != columns.len() {
        anyhow::bail!("{} feature columns but {} names", x.ncols(), columns.len());
    }
    info!(model_type = %config.model_type, rows = x.nrows(), "Training LTV model");

    let mut x = x.clone();
    impute_median(&mut x, columns)?;

    let split = shuffled_split(x.nrows(), config.test_size, config.seed)?;
    let x_train = x.select(Axis(0), &split.train);
    let y_train = y.select(Axis(0), &split.train);
    let x_test = x.select(Axis(0), &split.test);
    let y_test = y.select(Axis(0), &split.test);

    let estimator = match config.model_type {
        LtvModelType::Linear => {
            LtvEstimator::Linear(LinearModel::fit(x_train.view(), y_train.view())?)
        }
        LtvModelType::RandomForest => {
            let params = RandomForestRegressorParameters::default()
                .with_n_trees(config.n_estimators)
                .with_seed(config.seed);
            let forest =
                ForestRegressor::fit(&dense_matrix(x_train.view()), &y_train.to_vec(), params)?;
            LtvEstimator::RandomForest(Arc::new(forest))
        }
    };
    let model = LtvModel {
        model_type: config.model_type,
        schema: FeatureSchema::new(columns),
        estimator,
    };

    let predicted = model.predict(x_test.view(), columns)?;
    let metrics = RegressionMetrics::new(&y_test, &predicted)?;
    info!(model_type = %config.model_type, %metrics, "LTV model evaluated");

    Ok(LtvTrainingOutput { model, split, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfm::compute_rfm;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn tx(id: &str, when: NaiveDateTime, amount: f64) -> Transaction {
        Transaction {
            customer_id: id.to_string(),
            invoice_date: when,
            total_price: amount,
        }
    }

    /// Target is an exact linear function of two features
    fn linear_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let mut x = Array2::zeros((n, 5));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            x[[i, 0]] = (i * 7 % 97) as f64;
            x[[i, 1]] = (1 + i % 11) as f64;
            x[[i, 2]] = (i * 31 % 400) as f64;
            x[[i, 3]] = (i * 3 % 50) as f64 + x[[i, 0]];
            x[[i, 4]] = ((i * 17) % 23) as f64;
            y[i] = 3.0 * x[[i, 2]] - 2.0 * x[[i, 0]] + 15.0;
        }
        (x, y)
    }

    #[test]
    fn test_historical_ltv_full_and_windowed() {
        let transactions = vec![
            tx("a", date(2011, 1, 1), 100.0),
            tx("a", date(2011, 12, 1), 50.0),
            tx("b", date(2011, 12, 9), 20.0),
        ];

        let full = historical_ltv(&transactions, None).unwrap();
        assert_eq!(full["a"], 150.0);
        assert_eq!(full["b"], 20.0);

        let recent = historical_ltv(&transactions, Some(30)).unwrap();
        assert_eq!(recent["a"], 50.0);
        assert_eq!(recent["b"], 20.0);
    }

    #[test]
    fn test_model_type_parsing() {
        assert_eq!("linear".parse::<LtvModelType>().unwrap(), LtvModelType::Linear);
        assert_eq!("random_forest".parse::<LtvModelType>().unwrap(), LtvModelType::RandomForest);
        assert!("xgboost".parse::<LtvModelType>().is_err());
    }

    #[test]
    fn test_feature_matrix_with_churn_label() {
        let transactions = vec![
            tx("a", date(2011, 1, 1), 100.0),
            tx("b", date(2011, 12, 9), 20.0),
        ];
        let table = compute_rfm(&transactions, None).unwrap();

        let (x, columns) = ltv_feature_matrix(&table, None).unwrap();
        assert_eq!(columns, FEATURE_COLUMNS.to_vec());
        assert_eq!(x.ncols(), 5);

        let (x, columns) = ltv_feature_matrix(&table, Some(&[1, 0])).unwrap();
        assert_eq!(columns.last(), Some(&CHURN_LABEL_COLUMN));
        assert_eq!(x.column(5).to_vec(), vec![1.0, 0.0]);

        assert!(ltv_feature_matrix(&table, Some(&[1])).is_err());
    }

    #[test]
    fn test_align_targets_skips_unknown_customers() {
        let transactions = vec![
            tx("a", date(2011, 1, 1), 100.0),
            tx("b", date(2011, 12, 9), 20.0),
            tx("c", date(2011, 12, 9), 20.0),
        ];
        let table = compute_rfm(&transactions, None).unwrap();
        let targets = HashMap::from([("a".to_string(), 5.0), ("c".to_string(), 7.0)]);

        let (rows, y) = align_targets(&table, &targets);
        assert_eq!(rows, vec![0, 2]);
        assert_eq!(y.to_vec(), vec![5.0, 7.0]);
    }

    #[test]
    fn test_linear_model_recovers_coefficients() {
        let (x, y) = linear_data(60);
        let model = LinearModel::fit(x.view(), y.view()).unwrap();
        assert!((model.coefficients()[2] - 3.0).abs() < 1e-6);
        assert!((model.coefficients()[0] + 2.0).abs() < 1e-6);
        assert!((model.intercept() - 15.0).abs() < 1e-4);
    }

    #[test]
    fn test_linear_model_ignores_constant_column() {
        let (mut x, y) = linear_data(40);
        x.column_mut(4).fill(1.0);
        let model = LinearModel::fit(x.view(), y.view()).unwrap();
        assert_eq!(model.coefficients()[4], 0.0);
        let predicted = model.predict(x.view());
        assert!((predicted[7] - y[7]).abs() < 1e-4);
    }

    #[test]
    fn test_train_linear() {
        let (x, y) = linear_data(50);
        let config = LtvTrainingConfig {
            model_type: LtvModelType::Linear,
            ..LtvTrainingConfig::default()
        };
        let output = train_ltv_model(&x, &FEATURE_COLUMNS, &y, &config).unwrap();

        assert_eq!(output.split.test.len(), 10);
        assert!(output.metrics.mae < 1e-4);
        assert!(output.metrics.r2 > 0.999);
        assert_eq!(output.model.feature_importances().unwrap()[0].0, "Monetary");
    }

    #[test]
    fn test_train_random_forest() {
        let (x, y) = linear_data(80);
        let config = LtvTrainingConfig {
            n_estimators: 30,
            ..LtvTrainingConfig::default()
        };
        let output = train_ltv_model(&x, &FEATURE_COLUMNS, &y, &config).unwrap();
        assert_eq!(output.split.train.len() + output.split.test.len(), 80);
        assert!(output.metrics.r2 > 0.5);
        assert!(output.model.feature_importances().is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (x, y) = linear_data(40);
        let config = LtvTrainingConfig {
            n_estimators: 10,
            ..LtvTrainingConfig::default()
        };
        let output = train_ltv_model(&x, &FEATURE_COLUMNS, &y, &config).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("ltv.json");
        output.model.save(&path).unwrap();
        let loaded = LtvModel::load(&path).unwrap();

        assert_eq!(
            loaded.predict(x.view(), &FEATURE_COLUMNS).unwrap(),
            output.model.predict(x.view(), &FEATURE_COLUMNS).unwrap()
        );
        assert!(LtvModel::load_if_present(dir.path().join("nope.json")).unwrap().is_none());
    }
}
